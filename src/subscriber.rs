// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Subscriber Dispatch Loop
//!
//! Binds the queue to the exchange once per registered event name, then
//! consumes deliveries one at a time (the channel prefetch is 1, set at
//! startup) and dispatches each by routing key to its registered handler.
//!
//! Per delivery the loop restores the trace context from the headers,
//! deserializes the payload into the registered event type, awaits the
//! handler, and then acknowledges the delivery exactly once. Handler and
//! deserialization failures are logged and surfaced via span status; the
//! delivery is still acked, so failed messages are dropped rather than
//! redelivered.

use crate::{
    channel::ChannelHandle, config::BrokerConfig, errors::AmqpError, otel,
    registry::SubscriptionRegistry,
};
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, QueueBindOptions},
    types::FieldTable,
    Channel,
};
use opentelemetry::global::{self, BoxedTracer};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Observer for consumer lifecycle transitions.
///
/// Composed explicitly into the subscriber instead of ad hoc event
/// subscriptions; the default implementation only logs.
#[cfg_attr(test, mockall::automock)]
pub trait ConsumerLifecycleObserver: Send + Sync {
    fn on_registered(&self, consumer_tag: &str);
    fn on_unregistered(&self, consumer_tag: &str);
    fn on_cancelled(&self, consumer_tag: &str);
    fn on_shutdown(&self);
}

/// Default lifecycle observer that records transitions in the log.
pub struct LoggingLifecycleObserver;

impl ConsumerLifecycleObserver for LoggingLifecycleObserver {
    fn on_registered(&self, consumer_tag: &str) {
        debug!(consumer_tag, "consumer registered");
    }

    fn on_unregistered(&self, consumer_tag: &str) {
        debug!(consumer_tag, "consumer unregistered");
    }

    fn on_cancelled(&self, consumer_tag: &str) {
        warn!(consumer_tag, "consumer cancelled");
    }

    fn on_shutdown(&self) {
        info!("subscriber shutting down");
    }
}

/// Consumes deliveries from the configured queue and dispatches them to the
/// registered handlers.
pub struct Subscriber {
    config: Arc<BrokerConfig>,
    channel: ChannelHandle,
    registry: Arc<SubscriptionRegistry>,
    observer: Arc<dyn ConsumerLifecycleObserver>,
}

impl Subscriber {
    pub fn new(
        config: Arc<BrokerConfig>,
        channel: ChannelHandle,
        registry: Arc<SubscriptionRegistry>,
    ) -> Subscriber {
        Subscriber {
            config,
            channel,
            registry,
            observer: Arc::new(LoggingLifecycleObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ConsumerLifecycleObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Binds the queue and consumes deliveries until the consumer stream
    /// ends.
    ///
    /// With prefetch 1 the broker hands over at most one unacknowledged
    /// delivery, so processing is strictly sequential: the next delivery is
    /// only received after the current one is acked.
    pub async fn consume_blocking(&self) -> Result<(), AmqpError> {
        let channel = self.channel.get()?;

        self.bind_subscriptions(&channel).await?;

        let consumer_tag = format!("{}-consumer", self.config.queue);

        let mut consumer = match channel
            .basic_consume(
                &self.config.queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                return Err(AmqpError::ConsumerError(self.config.queue.clone()));
            }
        };

        self.observer.on_registered(&consumer_tag);

        let tracer = global::tracer(otel::SPAN_SOURCE);

        while let Some(result) = consumer.next().await {
            match result {
                Ok(delivery) => {
                    if let Err(err) = self.dispatch(&tracer, delivery).await {
                        error!(error = err.to_string(), "error consuming delivery");
                    }
                }
                Err(err) => error!(error = err.to_string(), "error receiving delivery"),
            }
        }

        self.observer.on_cancelled(&consumer_tag);

        Ok(())
    }

    /// Shutdown hook: stops accepting new deliveries by closing the
    /// subscribe channel.
    ///
    /// The connection is not closed here, it is owned by the connection
    /// manager. An in-flight handler is not awaited.
    pub async fn shutdown(&self) {
        self.observer.on_shutdown();

        if let Ok(channel) = self.channel.get() {
            if let Err(err) = channel.close(200, "shutting down").await {
                error!(error = err.to_string(), "error closing subscribe channel");
            }
        }

        self.observer
            .on_unregistered(&format!("{}-consumer", self.config.queue));
    }

    async fn bind_subscriptions(&self, channel: &Channel) -> Result<(), AmqpError> {
        if self.registry.is_empty() {
            warn!("no event subscriptions registered, queue will stay unbound");
        }

        for event_name in self.registry.event_names() {
            debug!(
                queue = self.config.queue,
                exchange = self.config.exchange,
                event = event_name,
                "binding queue to event"
            );

            if let Err(err) = channel
                .queue_bind(
                    &self.config.queue,
                    &self.config.exchange,
                    event_name,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
            {
                error!(error = err.to_string(), "error to bind queue to exchange");
                return Err(AmqpError::BindQueueError(
                    self.config.queue.clone(),
                    self.config.exchange.clone(),
                ));
            }
        }

        info!("all event subscriptions bound");

        Ok(())
    }

    /// Processes one delivery and acknowledges it exactly once.
    ///
    /// The handler is awaited to completion before the ack, and the ack
    /// happens regardless of the handler outcome.
    async fn dispatch(&self, tracer: &BoxedTracer, delivery: Delivery) -> Result<(), AmqpError> {
        let event_name = delivery.routing_key.to_string();

        let span = otel::start_process(
            tracer,
            &delivery.properties,
            &event_name,
            &self.config.queue,
        );
        let correlation_id = span.correlation_id();

        debug!(event = event_name, correlation_id, "received event");

        let failed = match self.handle(&event_name, &delivery.data, &correlation_id).await {
            Ok(()) => false,
            Err(err) => {
                span.record_failure(&err);
                true
            }
        };

        let acked = delivery.ack(BasicAckOptions { multiple: false }).await;
        if let Err(err) = &acked {
            error!(
                event = event_name,
                error = err.to_string(),
                "error whiling ack msg"
            );
        }

        span.stop(failed || acked.is_err());

        debug!(
            event = event_name,
            correlation_id, "finished processing event"
        );

        acked.map_err(|_| AmqpError::AckMessageError)
    }

    async fn handle(
        &self,
        event_name: &str,
        data: &[u8],
        correlation_id: &str,
    ) -> Result<(), AmqpError> {
        let payload = match std::str::from_utf8(data) {
            Ok(payload) => payload,
            Err(err) => {
                error!(
                    event = event_name,
                    correlation_id,
                    error = err.to_string(),
                    "error decoding payload as utf-8"
                );
                return Err(AmqpError::DeserializeError(err.to_string()));
            }
        };

        let entry = match self.registry.get(event_name) {
            Ok(entry) => entry,
            Err(err) => {
                // Only bound names are ever delivered, so this indicates a
                // registry/binding mismatch. The delivery is dropped.
                warn!(
                    event = event_name,
                    payload,
                    correlation_id,
                    "no subscription for event, dropping"
                );
                return Err(err);
            }
        };

        match entry.create().invoke(payload, correlation_id).await {
            Ok(()) => {
                debug!(
                    event = event_name,
                    correlation_id, "message successfully processed"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    handler = entry.handler_name(),
                    event = event_name,
                    payload,
                    correlation_id,
                    error = err.to_string(),
                    "error executing event handler"
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventHandler, HandlerError};
    use async_trait::async_trait;
    use lapin::{acker::Acker, BasicProperties};
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct OrderCreated {
        order_id: String,
    }

    impl Event for OrderCreated {
        const NAME: &'static str = "OrderCreated";
    }

    struct RecordingHandler {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        type Event = OrderCreated;

        async fn handle(&self, event: OrderCreated, _: &str) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(event.order_id);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl EventHandler for FailingHandler {
        type Event = OrderCreated;

        async fn handle(&self, _: OrderCreated, _: &str) -> Result<(), HandlerError> {
            Err("boom".into())
        }
    }

    fn config() -> Arc<BrokerConfig> {
        Arc::new(BrokerConfig {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            exchange: "events".to_owned(),
            queue: "orders".to_owned(),
        })
    }

    fn subscriber(registry: SubscriptionRegistry) -> Subscriber {
        Subscriber::new(config(), ChannelHandle::new(), Arc::new(registry))
    }

    #[tokio::test]
    async fn dispatches_a_delivery_to_the_registered_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        let registry = SubscriptionRegistry::new().register(move || RecordingHandler {
            seen: Arc::clone(&captured),
        });

        subscriber(registry)
            .handle("OrderCreated", br#"{"orderId":"123"}"#, "corr-1")
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap().as_slice(), &["123".to_owned()]);
    }

    #[tokio::test]
    async fn handler_failure_is_surfaced_but_does_not_panic() {
        let registry = SubscriptionRegistry::new().register(|| FailingHandler);

        let err = subscriber(registry)
            .handle("OrderCreated", br#"{"orderId":"123"}"#, "corr-1")
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::HandlerError("boom".to_owned()));
    }

    #[tokio::test]
    async fn unknown_event_is_reported_and_dropped() {
        let registry = SubscriptionRegistry::new().register(|| FailingHandler);

        let err = subscriber(registry)
            .handle("OrderShipped", br#"{"orderId":"123"}"#, "corr-1")
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::UnknownEvent("OrderShipped".to_owned()));
    }

    #[tokio::test]
    async fn invalid_utf8_payload_is_a_deserialization_error() {
        let registry = SubscriptionRegistry::new().register(|| FailingHandler);

        let err = subscriber(registry)
            .handle("OrderCreated", &[0xff, 0xfe], "corr-1")
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::DeserializeError(_)));
    }

    fn delivery(routing_key: &str, data: &[u8]) -> Delivery {
        Delivery {
            delivery_tag: 1,
            exchange: "events".into(),
            routing_key: routing_key.into(),
            redelivered: false,
            properties: BasicProperties::default(),
            data: data.to_vec(),
            acker: Acker::default(),
        }
    }

    #[tokio::test]
    async fn delivery_is_acked_even_when_the_handler_fails() {
        let registry = SubscriptionRegistry::new().register(|| FailingHandler);
        let subscriber = subscriber(registry);
        let tracer = global::tracer(otel::SPAN_SOURCE);

        let result = subscriber
            .dispatch(&tracer, delivery("OrderCreated", br#"{"orderId":"123"}"#))
            .await;

        // The handler failure is absorbed, the delivery is still acked.
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn delivery_is_acked_when_the_handler_succeeds() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        let registry = SubscriptionRegistry::new().register(move || RecordingHandler {
            seen: Arc::clone(&captured),
        });
        let subscriber = subscriber(registry);
        let tracer = global::tracer(otel::SPAN_SOURCE);

        let result = subscriber
            .dispatch(&tracer, delivery("OrderCreated", br#"{"orderId":"123"}"#))
            .await;

        assert_eq!(result, Ok(()));
        assert_eq!(seen.lock().unwrap().as_slice(), &["123".to_owned()]);
    }

    #[tokio::test]
    async fn consuming_before_startup_fails_fast() {
        let registry = SubscriptionRegistry::new().register(|| FailingHandler);

        let err = subscriber(registry).consume_blocking().await.unwrap_err();

        assert_eq!(err, AmqpError::ChannelNotReady);
    }

    #[tokio::test]
    async fn shutdown_notifies_the_lifecycle_observer() {
        let mut observer = MockConsumerLifecycleObserver::new();
        observer.expect_on_shutdown().times(1).return_const(());
        observer
            .expect_on_unregistered()
            .withf(|tag| tag == "orders-consumer")
            .times(1)
            .return_const(());

        let registry = SubscriptionRegistry::new().register(|| FailingHandler);
        let subscriber = subscriber(registry).with_observer(Arc::new(observer));

        subscriber.shutdown().await;
    }
}
