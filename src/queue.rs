// Copyright (c) 2025, The Amqp Transport Authors
// MIT License
// All rights reserved.

//! # Queue Declarations
//!
//! Option structs for queue assertion and consumption, plus the
//! `QueueDescriptor` bulk-declaration shape processed once per channel bind.

use crate::exchange::ExchangeKind;
use serde::Deserialize;

/// Options applied when asserting a queue.
///
/// Builder methods mirror the broker flags; everything defaults to off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueueOptions {
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub passive: bool,
}

impl QueueOptions {
    pub fn new() -> QueueOptions {
        QueueOptions::default()
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Checks for existence without creating the queue.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }
}

/// Options applied when starting a consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Broker-side auto-acknowledge; jobs created under this flag are
    /// pre-acknowledged and their ack/nack calls are no-ops.
    pub no_ack: bool,
    pub exclusive: bool,
    /// Consumer tag to request; the broker generates one when empty.
    pub consumer_tag: Option<String>,
}

impl ConsumeOptions {
    pub fn new() -> ConsumeOptions {
        ConsumeOptions::default()
    }

    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }
}

/// Bulk declaration of one exchange plus the routing-key-bound queues under it.
///
/// Processed once per channel bind: the exchange is asserted, then for every
/// route a queue is asserted and bound. Queue names are `"<exchange>.<route>"`
/// unless `autogenerate_queues` asks the broker for generated names.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueDescriptor {
    pub exchange: String,
    #[serde(default)]
    pub exchange_type: ExchangeKind,
    #[serde(default)]
    pub autogenerate_queues: bool,
    pub routes: Vec<String>,
    #[serde(default)]
    pub options: QueueOptions,
}

impl QueueDescriptor {
    pub fn new(exchange: &str) -> QueueDescriptor {
        QueueDescriptor {
            exchange: exchange.to_owned(),
            exchange_type: ExchangeKind::Direct,
            autogenerate_queues: false,
            routes: vec![],
            options: QueueOptions::default(),
        }
    }

    pub fn exchange_type(mut self, kind: ExchangeKind) -> Self {
        self.exchange_type = kind;
        self
    }

    pub fn autogenerate_queues(mut self) -> Self {
        self.autogenerate_queues = true;
        self
    }

    pub fn route(mut self, route: &str) -> Self {
        self.routes.push(route.to_owned());
        self
    }

    pub fn options(mut self, options: QueueOptions) -> Self {
        self.options = options;
        self
    }

    /// Name of the queue asserted for `route`; empty when the broker should
    /// generate one.
    pub fn queue_name(&self, route: &str) -> String {
        if self.autogenerate_queues {
            String::new()
        } else {
            format!("{}.{}", self.exchange, route)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_names_queues_after_exchange_and_route() {
        let descriptor = QueueDescriptor::new("task").route("command");
        assert_eq!(descriptor.queue_name("command"), "task.command");
    }

    #[test]
    fn autogenerated_queues_have_empty_names() {
        let descriptor = QueueDescriptor::new("task")
            .autogenerate_queues()
            .route("command");
        assert_eq!(descriptor.queue_name("command"), "");
    }

    #[test]
    fn queue_options_builder_sets_flags() {
        let options = QueueOptions::new().durable().exclusive();
        assert!(options.durable);
        assert!(options.exclusive);
        assert!(!options.auto_delete);
    }
}
