// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels with each message inside its AMQP headers. The
//! publisher injects the caller's context; the consumer extracts it and opens
//! a consumer span around the handler.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::warn;

/// Name of the tracer used for consumer spans
pub(crate) const TRACER_NAME: &str = "amqp consumer";

/// Writes trace context into the headers of an outbound message.
///
/// Keys are lowercased so that any consumer finds them regardless of how the
/// propagator spells them.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

/// Reads trace context from the headers of a delivery.
///
/// Only long-string headers carry context; any other header type, and any
/// value that is not UTF-8, reads as absent.
pub(crate) struct HeaderExtractor<'a> {
    headers: Option<&'a BTreeMap<ShortString, AMQPValue>>,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: Option<&'a BTreeMap<ShortString, AMQPValue>>) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers?.get(key)? {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .map_err(|err| warn!(header = key, error = %err, "trace header is not utf-8"))
                .ok(),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers
            .map(|headers| headers.keys().map(ShortString::as_str).collect())
            .unwrap_or_default()
    }
}

/// Renders the current trace context as message headers.
pub(crate) fn inject_current() -> FieldTable {
    let mut headers = BTreeMap::new();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&Context::current(), &mut HeaderInjector::new(&mut headers))
    });

    FieldTable::from(headers)
}

/// Starts the consumer span of a delivery from `queue`.
///
/// The span is parented on the context the publisher injected, if any; that
/// context is returned as well so the handler can continue the trace.
pub(crate) fn new_span(
    props: &AMQPProperties,
    tracer: &BoxedTracer,
    queue: &str,
) -> (Context, BoxedSpan) {
    let headers = props.headers().as_ref().map(FieldTable::inner);
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers))
    });

    let span = tracer
        .span_builder(Cow::from(queue.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
