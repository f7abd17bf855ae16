// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module creates and publishes the two channels used by the event
//! client: a publish channel and a subscribe channel, both multiplexed over
//! the shared connection and bound to the configured topic exchange.
//!
//! The channels are exposed through `ChannelHandle` accessors that stay empty
//! until `ChannelSet::start` completes. Using a handle before startup is a
//! programming error and fails fast with `AmqpError::ChannelNotReady`.

use crate::{config::BrokerConfig, connection::ConnectionManager, errors::AmqpError};
use lapin::{
    options::{BasicQosOptions, ExchangeDeclareOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel, ExchangeKind,
};
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, warn};

/// Maximum number of unacknowledged deliveries per consumer.
///
/// One in-flight message at a time is the backpressure invariant of the
/// dispatch loop: the broker will not push the next delivery until the
/// current one is acked.
const PREFETCH_COUNT: u16 = 1;

/// Accessor for a channel that is set once during startup.
#[derive(Clone, Default)]
pub struct ChannelHandle {
    inner: Arc<OnceLock<Arc<Channel>>>,
}

impl ChannelHandle {
    pub fn new() -> ChannelHandle {
        ChannelHandle::default()
    }

    /// Returns the channel, or `ChannelNotReady` if startup has not set it.
    pub fn get(&self) -> Result<Arc<Channel>, AmqpError> {
        self.inner.get().cloned().ok_or(AmqpError::ChannelNotReady)
    }

    fn set(&self, channel: Arc<Channel>) {
        if self.inner.set(channel).is_err() {
            warn!("channel was already set, keeping the original");
        }
    }
}

/// The publish and subscribe channels created at startup.
#[derive(Clone, Default)]
pub struct ChannelSet {
    publish: ChannelHandle,
    subscribe: ChannelHandle,
}

impl ChannelSet {
    pub fn new() -> ChannelSet {
        ChannelSet::default()
    }

    /// Accessor used by the publisher. Empty until `start` completes.
    pub fn publish_channel(&self) -> ChannelHandle {
        self.publish.clone()
    }

    /// Accessor used by the subscriber. Empty until `start` completes.
    pub fn subscribe_channel(&self) -> ChannelHandle {
        self.subscribe.clone()
    }

    /// Startup hook: creates both channels over the shared connection.
    ///
    /// The topic exchange is declared on each channel (idempotent). The
    /// subscribe channel additionally declares the durable queue and sets the
    /// consumer prefetch limit. Declare failures are fatal and not retried.
    pub async fn start(
        &self,
        manager: &ConnectionManager,
        config: &BrokerConfig,
    ) -> Result<(), AmqpError> {
        let conn = manager.get_connection().await?;

        debug!("creating subscribe channel...");
        let subscribe = create_channel(&conn).await?;
        declare_topic_exchange(&subscribe, &config.exchange).await?;
        declare_queue(&subscribe, &config.queue).await?;

        if let Err(err) = subscribe
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await
        {
            error!(error = err.to_string(), "error to configure qos");
            return Err(AmqpError::QosError(config.queue.clone()));
        }

        self.subscribe.set(Arc::new(subscribe));
        debug!("subscribe channel created");

        debug!("creating publish channel...");
        let publish = create_channel(&conn).await?;
        declare_topic_exchange(&publish, &config.exchange).await?;

        self.publish.set(Arc::new(publish));
        debug!("publish channel created");

        Ok(())
    }
}

async fn create_channel(conn: &lapin::Connection) -> Result<Channel, AmqpError> {
    match conn.create_channel().await {
        Ok(channel) => Ok(channel),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}

async fn declare_topic_exchange(channel: &Channel, exchange: &str) -> Result<(), AmqpError> {
    match channel
        .exchange_declare(
            exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(err) => {
            error!(
                error = err.to_string(),
                name = exchange,
                "error to declare the exchange"
            );
            Err(AmqpError::DeclareExchangeError(exchange.to_owned()))
        }
    }
}

async fn declare_queue(channel: &Channel, queue: &str) -> Result<(), AmqpError> {
    match channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(err) => {
            error!(
                error = err.to_string(),
                name = queue,
                "error to declare the queue"
            );
            Err(AmqpError::DeclareQueueError(queue.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_fails_fast_before_startup() {
        let set = ChannelSet::new();

        assert_eq!(
            set.publish_channel().get().unwrap_err(),
            AmqpError::ChannelNotReady
        );
        assert_eq!(
            set.subscribe_channel().get().unwrap_err(),
            AmqpError::ChannelNotReady
        );
    }

}
