// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Event Publisher
//!
//! Serializes an event to JSON, starts a producer span, injects the trace
//! context into the message headers, and publishes to the configured topic
//! exchange under the event name as routing key.
//!
//! A fresh header map is built for every publish, so concurrent publishes
//! never share mutable metadata. Publish failures are logged with the full
//! payload, mark the span failed, and are returned to the caller.

use crate::{channel::ChannelHandle, config::BrokerConfig, errors::AmqpError, event::Event, otel};
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::global;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Content type of every published message body
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Publishes application events to the configured exchange.
///
/// Safe to share and call concurrently once startup has set the publish
/// channel.
pub struct EventPublisher {
    config: Arc<BrokerConfig>,
    channel: ChannelHandle,
}

impl EventPublisher {
    pub fn new(config: Arc<BrokerConfig>, channel: ChannelHandle) -> Arc<EventPublisher> {
        Arc::new(EventPublisher { config, channel })
    }

    /// Publishes one event.
    ///
    /// The routing key is the event's `NAME`. The message carries the JSON
    /// body, a fresh message id, and headers with the injected trace context
    /// of the producer span.
    pub async fn publish<E: Event>(&self, event: &E) -> Result<(), AmqpError> {
        let channel = self.channel.get()?;

        let payload = serde_json::to_string(event)
            .map_err(|_| AmqpError::SerializeError(E::NAME.to_owned()))?;

        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        let tracer = global::tracer(otel::SPAN_SOURCE);
        let span = otel::start_send(
            &tracer,
            &mut headers,
            E::NAME,
            &payload,
            &self.config.queue,
        );

        let result = channel
            .basic_publish(
                &self.config.exchange,
                E::NAME,
                BasicPublishOptions::default(),
                payload.as_bytes(),
                BasicProperties::default()
                    .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
                    .with_type(ShortString::from(E::NAME))
                    .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
                    .with_headers(FieldTable::from(headers)),
            )
            .await;

        match result {
            Ok(_) => {
                debug!(
                    event = E::NAME,
                    exchange = self.config.exchange,
                    correlation_id = span.correlation_id(),
                    "event published"
                );
                span.stop(false);
                Ok(())
            }
            Err(err) => {
                error!(
                    event = E::NAME,
                    payload,
                    error = err.to_string(),
                    "error publishing event"
                );
                let failure = AmqpError::PublishError(err.to_string());
                span.record_failure(&failure);
                span.stop(true);
                Err(failure)
            }
        }
    }
}
