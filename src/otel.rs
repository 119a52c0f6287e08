// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! This module provides integration with OpenTelemetry for distributed tracing.
//! It includes utilities for propagating trace context through RabbitMQ message headers,
//! extracting context from incoming messages, and creating trace spans for message processing.

use crate::transport::Delivery;
use lapin::types::{AMQPValue, ShortString};
use opentelemetry::{
    global::{self, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, TraceContextExt, Tracer},
    Context,
};
use std::collections::BTreeMap;
use tracing::error;
use uuid::Uuid;

/// Name of the span started for every consumed delivery.
pub const CONSUME_SPAN_NAME: &str = "rabbitmq.consume";

/// Writes trace context entries into RabbitMQ message headers.
pub struct HeaderInjector<'a>(pub &'a mut BTreeMap<ShortString, AMQPValue>);

impl Injector for HeaderInjector<'_> {
    /// Sets a trace context key-value pair in RabbitMQ message headers.
    ///
    /// Keys are lowercased so that extraction does not depend on the casing
    /// used by the propagator.
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

/// Reads trace context entries from RabbitMQ message headers.
pub struct HeaderExtractor<'a>(pub &'a BTreeMap<ShortString, AMQPValue>);

impl Extractor for HeaderExtractor<'_> {
    /// Gets a trace context value from RabbitMQ message headers.
    ///
    /// Only string headers are considered; any other AMQP value yields `None`.
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|header_value| match header_value {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .map_err(|e| error!("Error decoding header value {:?}", e))
                .ok(),
            AMQPValue::ShortString(value) => Some(value.as_str()),
            _ => None,
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|header| header.as_str()).collect()
    }
}

/// Injects `ctx` into `headers` with the global text map propagator.
///
/// # Parameters
/// * `ctx` - OpenTelemetry context to propagate
/// * `headers` - Message headers receiving the trace entries
pub fn inject_context(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector(headers))
    });
}

/// Extracts the propagated context from `headers` with the global text map
/// propagator. Returns an empty context when the headers carry none.
pub fn extract_context(headers: &BTreeMap<ShortString, AMQPValue>) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
}

/// Trace identifiers bound to the processing of one delivery.
#[derive(Debug, Clone)]
pub struct TraceContext {
    /// OpenTelemetry context holding the consume span
    pub cx: Context,
    /// Hex trace id of the consume span
    pub trace_id: String,
    /// Hex span id of the consume span
    pub span_id: String,
    /// Freshly generated id for this processing
    pub request_id: String,
}

impl TraceContext {
    /// Captures the identifiers of the span active in `cx` and generates a new
    /// request id.
    pub fn from_context(cx: Context) -> Self {
        let (trace_id, span_id) = {
            let span = cx.span();
            let span_ctx = span.span_context();
            (span_ctx.trace_id().to_string(), span_ctx.span_id().to_string())
        };

        TraceContext {
            cx,
            trace_id,
            span_id,
            request_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Starts the consumer span for `delivery`.
///
/// The span is parented to the context propagated in the delivery headers, or
/// roots a new trace when the headers carry none. The span stays active in the
/// returned context until it is ended.
///
/// # Parameters
/// * `delivery` - The received message whose headers carry the parent context
/// * `tracer` - Tracer used to start the span
///
/// # Returns
/// A `TraceContext` holding the started span and its identifiers
pub fn start_consume_span(delivery: &Delivery, tracer: &BoxedTracer) -> TraceContext {
    let parent = extract_context(&delivery.headers());

    let span = tracer
        .span_builder(CONSUME_SPAN_NAME)
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &parent);

    TraceContext::from_context(parent.with_span(span))
}
