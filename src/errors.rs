// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Event Client
//!
//! This module provides the error taxonomy for the event client. The `AmqpError`
//! enum covers configuration loading, connection establishment, channel and
//! topology setup, publishing, and the subscribe-side dispatch path.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant provides specific context about what operation failed. Startup
/// errors (configuration, connection, declarations) are fatal; dispatch-side
/// errors (deserialization, handler failures) are logged and surfaced via span
/// status without interrupting consumption.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// A required configuration value is absent from the environment
    #[error("missing required configuration `{0}`")]
    MissingConfiguration(String),

    /// A configuration value is present but cannot be parsed
    #[error("invalid configuration value for `{0}`")]
    InvalidConfiguration(String),

    /// Error establishing a connection within the retry budget
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// A channel accessor was used before startup set the channel
    #[error("channel is not ready, startup has not completed")]
    ChannelNotReady,

    /// Error declaring the exchange with the given name
    #[error("failure to declare the exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring the queue with the given name
    #[error("failure to declare the queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding the queue to the exchange under a routing key
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindQueueError(String, String),

    /// Error configuring the consumer prefetch limit
    #[error("failure to configure qos on queue `{0}`")]
    QosError(String),

    /// Error creating or driving a consumer
    #[error("failure to consume from queue `{0}`")]
    ConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishError(String),

    /// Error serializing an event body for publishing
    #[error("failure to serialize event `{0}`")]
    SerializeError(String),

    /// Error deserializing a delivery payload into the registered event type
    #[error("failure to deserialize payload: {0}")]
    DeserializeError(String),

    /// A delivery arrived for an event name with no registered subscription
    #[error("no subscription registered for event `{0}`")]
    UnknownEvent(String),

    /// An event handler returned a failure
    #[error("handler failed: {0}")]
    HandlerError(String),

    /// Error acknowledging a delivery
    #[error("failure to ack message")]
    AckMessageError,
}
