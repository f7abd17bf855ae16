// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Registry
//!
//! An explicit registration table mapping each event name to the type it
//! deserializes into and a factory for its handler. The table is built once
//! at process initialization with the `register` builder and is immutable
//! afterwards; the subscriber binds the queue once per registered name and
//! resolves entries per delivery.

use crate::{
    errors::AmqpError,
    event::{Event, EventHandler},
};
use async_trait::async_trait;
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::warn;

/// Type-erased, per-delivery subscription.
///
/// Deserializes the payload into the registered event type and invokes the
/// handler with it.
#[async_trait]
pub(crate) trait ErasedSubscription: Send + Sync {
    async fn invoke(&self, payload: &str, correlation_id: &str) -> Result<(), AmqpError>;
}

struct Subscription<H>(H);

#[async_trait]
impl<H> ErasedSubscription for Subscription<H>
where
    H: EventHandler + 'static,
{
    async fn invoke(&self, payload: &str, correlation_id: &str) -> Result<(), AmqpError> {
        let event: H::Event = serde_json::from_str(payload)
            .map_err(|err| AmqpError::DeserializeError(err.to_string()))?;

        self.0
            .handle(event, correlation_id)
            .await
            .map_err(|err| AmqpError::HandlerError(err.to_string()))
    }
}

type SubscriptionFactory = Arc<dyn Fn() -> Box<dyn ErasedSubscription> + Send + Sync>;

/// One registered (event name → event type, handler type) mapping.
pub struct SubscriptionEntry {
    handler_name: &'static str,
    factory: SubscriptionFactory,
}

impl SubscriptionEntry {
    /// The handler type name, used for diagnostics on dispatch failures.
    pub fn handler_name(&self) -> &'static str {
        self.handler_name
    }

    /// Creates a fresh subscription for one delivery.
    pub(crate) fn create(&self) -> Box<dyn ErasedSubscription> {
        (self.factory)()
    }
}

impl fmt::Debug for SubscriptionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionEntry")
            .field("handler_name", &self.handler_name)
            .finish_non_exhaustive()
    }
}

/// The full set of event subscriptions known to the process.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<&'static str, SubscriptionEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> SubscriptionRegistry {
        SubscriptionRegistry::default()
    }

    /// Registers a handler for its event type.
    ///
    /// The routing key is the event's `NAME`; event names must be unique
    /// within the registry, a duplicate registration replaces the previous
    /// entry.
    pub fn register<H, F>(mut self, factory: F) -> Self
    where
        H: EventHandler + 'static,
        H::Event: Event,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let name = <H::Event as Event>::NAME;

        if self.entries.contains_key(name) {
            warn!(event = name, "event already registered, replacing handler");
        }

        self.entries.insert(
            name,
            SubscriptionEntry {
                handler_name: std::any::type_name::<H>(),
                factory: Arc::new(move || Box::new(Subscription(factory()))),
            },
        );

        self
    }

    /// All registered routing keys, used to bind the queue.
    pub fn event_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    /// Resolves the subscription entry for an event name.
    pub fn get(&self, name: &str) -> Result<&SubscriptionEntry, AmqpError> {
        self.entries
            .get(name)
            .ok_or_else(|| AmqpError::UnknownEvent(name.to_owned()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
