// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module owns the single long-lived connection to RabbitMQ. The
//! connection is created lazily on first demand, guarded by a mutex so only
//! one physical connection is ever established even under concurrent first
//! access, and retried on a fixed interval up to a total elapsed-time budget.
//!
//! There is no automatic reconnect after a successful startup. A dropped
//! connection surfaces as I/O failures at the channel level and the process
//! is expected to be restarted by the operator.

use crate::{config::BrokerConfig, errors::AmqpError};
use lapin::{types::LongString, Connection, ConnectionProperties};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::Mutex,
    time::{sleep, Instant},
};
use tracing::{debug, error, info, warn};

/// Retry schedule for connection establishment.
///
/// Attempts are made on a fixed `interval` until the next attempt would
/// exceed the `max_elapsed` budget, at which point the last connection
/// failure propagates as a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            interval: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(180),
        }
    }
}

/// Owns the shared RabbitMQ connection.
///
/// `get_connection` is idempotent: once a connection is established,
/// subsequent calls return the same instance without re-attempting.
pub struct ConnectionManager {
    config: Arc<BrokerConfig>,
    retry: RetryPolicy,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl ConnectionManager {
    pub fn new(config: Arc<BrokerConfig>) -> ConnectionManager {
        ConnectionManager {
            config,
            retry: RetryPolicy::default(),
            connection: Mutex::new(None),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the shared connection, creating it if absent.
    ///
    /// The lock is held for the duration of connection establishment only, so
    /// a second concurrent caller waits for the first attempt and then reuses
    /// its connection.
    pub async fn get_connection(&self) -> Result<Arc<Connection>, AmqpError> {
        let mut guard = self.connection.lock().await;

        if let Some(conn) = guard.as_ref() {
            return Ok(Arc::clone(conn));
        }

        let uri = self.config.amqp_uri();

        let conn = retry_until(&self.retry, || async {
            debug!("connecting to rabbitmq...");
            let options = ConnectionProperties::default()
                .with_connection_name(LongString::from(self.config.queue.clone()));

            match Connection::connect(&uri, options).await {
                Ok(c) => Ok(Arc::new(c)),
                Err(err) => {
                    warn!(error = err.to_string(), "failure to connect");
                    Err(AmqpError::ConnectionError(err.to_string()))
                }
            }
        })
        .await?;

        info!(host = self.config.host, "connected to rabbitmq");

        *guard = Some(Arc::clone(&conn));

        Ok(conn)
    }

    /// Closes the connection on process shutdown.
    pub async fn close(&self) {
        let mut guard = self.connection.lock().await;

        if let Some(conn) = guard.take() {
            if let Err(err) = conn.close(200, "shutting down").await {
                error!(error = err.to_string(), "error closing the connection");
            }
        }
    }
}

/// Runs `attempt` until it succeeds or the retry budget is exhausted.
///
/// After a failure the loop sleeps for the configured interval, unless that
/// would push the elapsed time past `max_elapsed`, in which case the last
/// error is returned.
pub(crate) async fn retry_until<T, F, Fut>(
    policy: &RetryPolicy,
    mut attempt: F,
) -> Result<T, AmqpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AmqpError>>,
{
    let started = Instant::now();

    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if started.elapsed() + policy.interval >= policy.max_elapsed {
                    error!(
                        error = err.to_string(),
                        "connection attempts exhausted, giving up"
                    );
                    return Err(err);
                }

                sleep(policy.interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retry_stops_after_the_elapsed_budget() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);

        let result: Result<(), AmqpError> = retry_until(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(AmqpError::ConnectionError("refused".to_owned())) }
        })
        .await;

        assert_eq!(
            result.unwrap_err(),
            AmqpError::ConnectionError("refused".to_owned())
        );
        // 10s interval over a 180s budget: attempts at t = 0s, 10s, ..., 170s.
        assert_eq!(attempts.load(Ordering::SeqCst), 18);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_failures() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);

        let result = retry_until(&policy, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(AmqpError::ConnectionError("refused".to_owned()))
                } else {
                    Ok("connected")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "connected");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_returns_without_sleeping() {
        let policy = RetryPolicy {
            interval: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(180),
        };
        let started = Instant::now();

        let result = retry_until(&policy, || async { Ok(1) }).await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
