// Copyright (c) 2025, The Amqp Transport Authors
// MIT License
// All rights reserved.

//! Shared test support: a scriptable in-memory physical channel recording
//! every broker operation, plus small helpers for closure-based handlers and
//! condition polling.

use crate::{
    channel::{AmqpChannel, ChannelLifecycle, ConsumerStream},
    consumer::{HandlerError, Job, MessageHandler},
    errors::AmqpError,
    exchange::ExchangeKind,
    message::{Delivery, MessageProperties},
    queue::{ConsumeOptions, QueueOptions},
    transport::ChannelFactory,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone)]
pub(crate) struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub properties: MessageProperties,
}

/// In-memory physical channel. Records every operation in call order and lets
/// tests push deliveries into registered consumers.
pub(crate) struct FakeChannel {
    ops: Mutex<Vec<String>>,
    published: Mutex<Vec<PublishedMessage>>,
    acks: Mutex<Vec<(u64, bool)>>,
    nacks: Mutex<Vec<(u64, bool, bool)>>,
    cancelled: Mutex<Vec<String>>,
    consumers: Mutex<HashMap<String, (String, mpsc::UnboundedSender<Delivery>)>>,
    lifecycle_tx: broadcast::Sender<ChannelLifecycle>,
    tag_seq: AtomicU64,
    gen_seq: AtomicU64,
    delivery_seq: AtomicU64,
}

fn kind_label(kind: ExchangeKind) -> &'static str {
    match kind {
        ExchangeKind::Direct => "direct",
        ExchangeKind::Fanout => "fanout",
        ExchangeKind::Topic => "topic",
        ExchangeKind::Headers => "headers",
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FakeChannel {
    pub(crate) fn new() -> Arc<FakeChannel> {
        let (lifecycle_tx, _) = broadcast::channel(8);
        Arc::new(FakeChannel {
            ops: Mutex::new(vec![]),
            published: Mutex::new(vec![]),
            acks: Mutex::new(vec![]),
            nacks: Mutex::new(vec![]),
            cancelled: Mutex::new(vec![]),
            consumers: Mutex::new(HashMap::new()),
            lifecycle_tx,
            tag_seq: AtomicU64::new(0),
            gen_seq: AtomicU64::new(0),
            delivery_seq: AtomicU64::new(0),
        })
    }

    pub(crate) fn ops(&self) -> Vec<String> {
        lock(&self.ops).clone()
    }

    pub(crate) fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    pub(crate) fn acks(&self) -> Vec<(u64, bool)> {
        lock(&self.acks).clone()
    }

    pub(crate) fn nacks(&self) -> Vec<(u64, bool, bool)> {
        lock(&self.nacks).clone()
    }

    pub(crate) fn cancelled(&self) -> Vec<String> {
        lock(&self.cancelled).clone()
    }

    /// Pushes a delivery to every live consumer of `queue`.
    pub(crate) fn deliver(&self, queue: &str, data: Vec<u8>, properties: MessageProperties) {
        let delivery_tag = self.delivery_seq.fetch_add(1, Ordering::Relaxed) + 1;
        for (consumer_queue, sender) in lock(&self.consumers).values() {
            if consumer_queue == queue {
                let _ = sender.send(Delivery {
                    delivery_tag,
                    exchange: String::new(),
                    routing_key: queue.to_owned(),
                    data: data.clone(),
                    properties: properties.clone(),
                });
            }
        }
    }

    pub(crate) fn emit(&self, event: ChannelLifecycle) {
        let _ = self.lifecycle_tx.send(event);
    }

    fn record(&self, op: String) {
        lock(&self.ops).push(op);
    }
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    async fn queue_declare(
        &self,
        queue: String,
        _options: QueueOptions,
    ) -> Result<String, AmqpError> {
        let name = if queue.is_empty() {
            format!("amq.gen-{}", self.gen_seq.fetch_add(1, Ordering::Relaxed) + 1)
        } else {
            queue
        };
        self.record(format!("queue_declare {name}"));
        Ok(name)
    }

    async fn queue_purge(&self, queue: String) -> Result<(), AmqpError> {
        self.record(format!("queue_purge {queue}"));
        Ok(())
    }

    async fn queue_delete(&self, queue: String) -> Result<(), AmqpError> {
        self.record(format!("queue_delete {queue}"));
        Ok(())
    }

    async fn exchange_declare(
        &self,
        exchange: String,
        kind: ExchangeKind,
    ) -> Result<(), AmqpError> {
        self.record(format!("exchange_declare {exchange} {}", kind_label(kind)));
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: String,
        exchange: String,
        routing_key: String,
    ) -> Result<(), AmqpError> {
        self.record(format!("queue_bind {queue} {exchange} {routing_key}"));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: String,
        routing_key: String,
        data: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        self.record(format!("publish {exchange} {routing_key}"));
        lock(&self.published).push(PublishedMessage {
            exchange,
            routing_key,
            data,
            properties,
        });
        Ok(())
    }

    async fn consume(
        &self,
        queue: String,
        options: ConsumeOptions,
    ) -> Result<ConsumerStream, AmqpError> {
        let consumer_tag = options.consumer_tag.unwrap_or_else(|| {
            format!("ctag-{}", self.tag_seq.fetch_add(1, Ordering::Relaxed) + 1)
        });
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.consumers).insert(consumer_tag.clone(), (queue.clone(), tx));
        self.record(format!("consume {queue}"));
        Ok(ConsumerStream {
            consumer_tag,
            deliveries: rx,
        })
    }

    async fn cancel(&self, consumer_tag: String) -> Result<(), AmqpError> {
        lock(&self.consumers).remove(&consumer_tag);
        lock(&self.cancelled).push(consumer_tag);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        lock(&self.acks).push((delivery_tag, multiple));
        Ok(())
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        lock(&self.nacks).push((delivery_tag, multiple, requeue));
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        lock(&self.nacks).push((delivery_tag, false, requeue));
        Ok(())
    }

    async fn qos(&self, count: u16, global: bool) -> Result<(), AmqpError> {
        self.record(format!("qos {count} {global}"));
        Ok(())
    }

    async fn recover(&self) -> Result<(), AmqpError> {
        self.record("recover".to_owned());
        Ok(())
    }

    fn lifecycle(&self) -> broadcast::Receiver<ChannelLifecycle> {
        self.lifecycle_tx.subscribe()
    }
}

/// Channel factory handing out fake channels; keeps every created channel so
/// tests can inspect them.
pub(crate) struct FakeFactory {
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeFactory {
    pub(crate) fn new() -> FakeFactory {
        FakeFactory {
            channels: Mutex::new(vec![]),
        }
    }

    /// The first channel handed out. Most tests run on the lone `default`
    /// logical channel.
    pub(crate) fn channel(&self) -> Arc<FakeChannel> {
        lock(&self.channels)[0].clone()
    }
}

#[async_trait]
impl ChannelFactory for FakeFactory {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let channel = FakeChannel::new();
        lock(&self.channels).push(channel.clone());
        Ok(channel)
    }
}

/// Wraps an async closure as a `MessageHandler`.
pub(crate) fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Value, Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    struct FnHandler<F>(F);

    #[async_trait]
    impl<F, Fut> MessageHandler for FnHandler<F>
    where
        F: Fn(Value, Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        async fn handle(&self, payload: Value, job: Job) -> Result<Value, HandlerError> {
            (self.0)(payload, job).await
        }
    }

    Arc::new(FnHandler(f))
}

/// Polls `cond` until it holds, failing the test after two seconds.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition was not met in time");
}
