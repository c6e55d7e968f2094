// Copyright (c) 2025, The Amqp Transport Authors
// MIT License
// All rights reserved.

//! # Wire Messages
//!
//! The JSON envelope carried on every message, the metadata stamped on it, and
//! the delivery handed to consumers by the physical channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Default content type for published messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Application envelope serialized as the message body.
///
/// `payload` is the value handed to handlers; `context` is an opaque
/// application value travelling alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl Envelope {
    pub fn new(payload: Value, context: Option<Value>) -> Envelope {
        Envelope { payload, context }
    }
}

/// Metadata stamped on a message, mirrored on each delivery.
///
/// `headers` carries flat string pairs and is where trace context is
/// propagated (see the `otel` module).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Opaque token pairing a command with its result/error message.
    pub correlation_id: Option<String>,
    /// Optional type label for the message.
    pub kind: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// One message handed over by the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub properties: MessageProperties,
}

/// Per-send options accepted by producers.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Application context resolved to a correlation id and carried in the
    /// envelope.
    pub context: Option<Value>,
    /// Type label stamped on message metadata.
    pub kind: Option<String>,
    /// Explicit correlation id; set by the framework when a resolver already
    /// ran, otherwise resolved from `context`.
    pub correlation_id: Option<String>,
}

impl SendOptions {
    pub fn with_context(context: Value) -> SendOptions {
        SendOptions {
            context: Some(context),
            ..SendOptions::default()
        }
    }
}
