// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event and Handler Contracts
//!
//! An event is a named, serializable payload. The event name doubles as the
//! routing key on the topic exchange, so it must be a stable identifier.
//!
//! Handlers declare the event type they consume; a fresh handler instance is
//! created per delivery by the subscription registry, keeping any
//! handler-local state isolated to a single message.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

/// An application event published to, or consumed from, the broker.
///
/// `NAME` is the routing key the event is published under and the key the
/// queue is bound with on the subscribe side.
///
/// Absent values should be omitted from the wire payload rather than
/// serialized as `null`: annotate optional fields with
/// `#[serde(skip_serializing_if = "Option::is_none")]`.
pub trait Event: Serialize + Send + Sync {
    const NAME: &'static str;
}

/// Failure returned by an event handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one deserialized event.
///
/// The correlation id is derived from the consumer span's trace id and ties
/// handler logs to the distributed trace of the originating publish.
#[async_trait]
pub trait EventHandler: Send + Sync {
    type Event: DeserializeOwned + Send;

    async fn handle(&self, event: Self::Event, correlation_id: &str) -> Result<(), HandlerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Serialize)]
    #[serde(rename_all = "camelCase")]
    struct OrderShipped {
        order_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tracking_code: Option<String>,
    }

    impl Event for OrderShipped {
        const NAME: &'static str = "OrderShipped";
    }

    #[test]
    fn absent_optional_fields_are_omitted_from_the_payload() {
        let payload = serde_json::to_string(&OrderShipped {
            order_id: "123".to_owned(),
            tracking_code: None,
        })
        .unwrap();

        assert_eq!(payload, r#"{"orderId":"123"}"#);
    }
}
