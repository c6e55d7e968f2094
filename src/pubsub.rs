// Copyright (c) 2025, The Amqp Transport Authors
// MIT License
// All rights reserved.

//! # Publish/Subscribe
//!
//! Fire-and-forget fan-out: a broadcaster publishes to a fanout exchange and
//! every receiver gets its own exclusive, auto-deleted queue bound to it. No
//! acknowledgements, no correlation, no replies.

use crate::{
    consumer::{Consumer, ConsumerSpec, MessageHandler},
    errors::AmqpError,
    exchange::ExchangeKind,
    message::SendOptions,
    producer::{Producer, ProducerSpec},
    queue::{ConsumeOptions, QueueOptions},
    transport::Transport,
};
use serde_json::Value;
use std::sync::Arc;

/// Declaration spec shared by both pubsub roles.
#[derive(Clone, Default)]
pub struct PubSubSpec {
    pub channel_name: Option<String>,
}

/// Publishes to a fanout exchange; routing keys are meaningless there.
pub struct Broadcaster {
    producer: Producer,
}

impl Broadcaster {
    pub async fn publish(&self, payload: Value) -> Result<(), AmqpError> {
        self.producer.send(payload, "", SendOptions::default()).await
    }
}

pub async fn create_broadcaster(
    transport: &Transport,
    exchange_name: &str,
    spec: PubSubSpec,
) -> Result<Broadcaster, AmqpError> {
    let producer = Producer::declare(
        transport,
        ProducerSpec {
            channel_name: spec.channel_name,
            exchange_name: exchange_name.to_owned(),
            exchange_type: ExchangeKind::Fanout,
            resolver: None,
        },
    )
    .await?;

    Ok(Broadcaster { producer })
}

/// Subscribes `handler` to every message broadcast on `exchange_name`.
///
/// Each receiver binds a server-named exclusive queue that vanishes with it,
/// so concurrent receivers all see every broadcast.
pub async fn create_receiver(
    transport: &Transport,
    exchange_name: &str,
    spec: PubSubSpec,
    handler: Arc<dyn MessageHandler>,
) -> Result<Consumer, AmqpError> {
    Consumer::declare(
        transport,
        ConsumerSpec {
            channel_name: spec.channel_name,
            queue_name: String::new(),
            exchange_name: Some(exchange_name.to_owned()),
            routing_patterns: vec![String::new()],
            queue_options: QueueOptions::new().exclusive().auto_delete(),
            consume_options: ConsumeOptions::new().no_ack(),
        },
        handler,
    )
    .await
}
