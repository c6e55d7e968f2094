// Copyright (c) 2025, The Amqp Transport Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Propagation
//!
//! Trace context travels in the transport's flat string headers. The broker
//! adapter injects the current context into every outgoing message; the
//! consumer loop extracts it and opens a consumer span per delivery.

use crate::message::MessageProperties;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Adapter injecting and extracting OpenTelemetry context from message headers.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut BTreeMap<String, String>,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

impl Extractor for HeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Injects the current trace context into the outgoing message properties.
pub(crate) fn inject_context(ctx: &Context, properties: &mut MessageProperties) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderPropagator::new(&mut properties.headers))
    });
}

/// Extracts the propagated context from a delivery and opens a consumer span.
pub(crate) fn new_span(
    properties: &MessageProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = properties.headers.clone();
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
