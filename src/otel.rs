// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! This module propagates trace context through RabbitMQ message headers and
//! creates the producer/consumer spans around publishing and dispatching.
//! The wire format is whatever text-map propagator the host installed
//! globally, typically W3C Trace Context.
//!
//! Spans are wrapped in `MessageSpan`, an explicit present/absent type: when
//! the global tracer is a no-op or the span is sampled out, the wrapper is
//! empty and every subsequent operation on it is skipped.

use crate::errors::AmqpError;
use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global::{self, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{Span, SpanKind, Status, TraceContextExt, TraceId, Tracer},
    Context, KeyValue,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;
use uuid::Uuid;

/// Instrumentation source name, the prefix of every span this crate creates.
pub const SPAN_SOURCE: &str = "rabbitmq_client";

/// An adapter for injecting and extracting OpenTelemetry context from
/// RabbitMQ headers.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for HeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// An explicitly optional message span.
///
/// Present when the tracer produced a valid span context, absent when span
/// creation was suppressed. `stop` consumes the wrapper, so the span status
/// is set and the span ended exactly once per `start_*` call.
pub(crate) struct MessageSpan {
    cx: Option<Context>,
}

impl MessageSpan {
    fn suppressed() -> MessageSpan {
        MessageSpan { cx: None }
    }

    pub(crate) fn trace_id(&self) -> Option<TraceId> {
        self.cx
            .as_ref()
            .map(|cx| cx.span().span_context().trace_id())
    }

    /// The trace id as a correlation id, or a fresh UUID when no span exists.
    pub(crate) fn correlation_id(&self) -> String {
        match self.trace_id() {
            Some(trace_id) => trace_id.to_string(),
            None => Uuid::new_v4().to_string(),
        }
    }

    pub(crate) fn record_failure(&self, err: &AmqpError) {
        if let Some(cx) = self.cx.as_ref() {
            cx.span().record_error(err);
        }
    }

    /// Sets the span status and ends it. No-op when the span is absent.
    pub(crate) fn stop(self, failed: bool) {
        if let Some(cx) = self.cx {
            let span = cx.span();
            if failed {
                span.set_status(Status::Error {
                    description: Cow::from("message operation failed"),
                });
            } else {
                span.set_status(Status::Ok);
            }
            span.end();
        }
    }
}

/// Starts a producer span and injects its context into the message headers.
///
/// The headers end up on the wire next to the payload, so the consumer side
/// can parent its span to this one.
pub(crate) fn start_send(
    tracer: &BoxedTracer,
    headers: &mut BTreeMap<ShortString, AMQPValue>,
    event_name: &str,
    payload: &str,
    queue: &str,
) -> MessageSpan {
    let mut attributes = messaging_attributes(event_name, queue);
    attributes.push(KeyValue::new(
        "messaging.message_payload",
        payload.to_owned(),
    ));

    let span = tracer
        .span_builder(Cow::from(format!("{SPAN_SOURCE}.Send")))
        .with_kind(SpanKind::Producer)
        .with_attributes(attributes)
        .start(tracer);

    if !span.span_context().is_valid() {
        return MessageSpan::suppressed();
    }

    let cx = Context::current_with_span(span);

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&cx, &mut HeaderPropagator::new(headers))
    });

    MessageSpan { cx: Some(cx) }
}

/// Starts a consumer span parented to the context carried in the delivery
/// headers.
///
/// Absent or malformed headers yield an empty parent context, so the span is
/// still usable as a root span.
pub(crate) fn start_process(
    tracer: &BoxedTracer,
    props: &AMQPProperties,
    event_name: &str,
    queue: &str,
) -> MessageSpan {
    let mut headers = props.headers().clone().unwrap_or_default().inner().clone();

    let parent = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(format!("{SPAN_SOURCE}.Process")))
        .with_kind(SpanKind::Consumer)
        .with_attributes(messaging_attributes(event_name, queue))
        .start_with_context(tracer, &parent);

    if !span.span_context().is_valid() {
        return MessageSpan::suppressed();
    }

    let cx = parent.with_span(span);

    MessageSpan { cx: Some(cx) }
}

fn messaging_attributes(event_name: &str, queue: &str) -> Vec<KeyValue> {
    vec![
        KeyValue::new("messaging.system", "rabbitmq"),
        KeyValue::new("messaging.destination_kind", "queue"),
        KeyValue::new("messaging.rabbitmq.queue", queue.to_owned()),
        KeyValue::new("messaging.rabbitmq.routing_key", event_name.to_owned()),
    ]
}
