// Copyright (c) 2025, The Amqp Transport Authors
// MIT License
// All rights reserved.

//! # Consumers
//!
//! Declaring a consumer registers a setup hook that asserts the queue, binds
//! its routing patterns and starts broker-level consumption. Every decoded
//! delivery is wrapped in a [`Job`] carrying the idempotent ack/nack state
//! machine before the handler runs; payloads that fail envelope decoding are
//! rejected without requeue and never reach the handler. The envelope must be
//! a JSON object: a body of literal `null` is not coerced to an empty
//! envelope, it is rejected like any other undecodable payload.

use crate::{
    channel::ChannelWrapper,
    errors::AmqpError,
    message::{Delivery, Envelope},
    otel,
    queue::{ConsumeOptions, QueueOptions},
    transport::{Transport, DEFAULT_CHANNEL},
};
use async_trait::async_trait;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use serde_json::Value;
use std::borrow::Cow;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Application-level handler failure.
///
/// On a command server this is what travels back over the error route as
/// `{message, details}`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerError {
    pub fn new(message: &str) -> HandlerError {
        HandlerError {
            message: message.to_owned(),
            details: None,
        }
    }

    pub fn with_details(message: &str, details: Value) -> HandlerError {
        HandlerError {
            message: message.to_owned(),
            details: Some(details),
        }
    }
}

/// Message handler invoked with the decoded payload and its job.
///
/// The returned value is ignored by plain consumers; command servers publish
/// it over the result route.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: Value, job: Job) -> Result<Value, HandlerError>;
}

/// Acknowledgment status of one delivery: `Pending → Acked` or
/// `Pending → Nacked`, never both and never re-enterable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Pending,
    Acked,
    Nacked,
}

/// One delivered message.
///
/// The job is the single arbiter of whether the underlying delivery receives
/// ack or nack; a second ack/nack call is a no-op and never issues a second
/// broker acknowledgment.
pub struct Job {
    channel: Arc<ChannelWrapper>,
    delivery: Delivery,
    context: Option<Value>,
    status: Mutex<AckStatus>,
}

impl Job {
    pub(crate) fn new(
        channel: Arc<ChannelWrapper>,
        delivery: Delivery,
        context: Option<Value>,
        pre_acked: bool,
    ) -> Job {
        Job {
            channel,
            delivery,
            context,
            // no_ack consumers were already acknowledged broker-side.
            status: Mutex::new(if pre_acked {
                AckStatus::Acked
            } else {
                AckStatus::Pending
            }),
        }
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.delivery.properties.correlation_id.as_deref()
    }

    /// Application context recovered for this delivery, when any.
    pub fn context(&self) -> Option<&Value> {
        self.context.as_ref()
    }

    pub(crate) fn with_context(mut self, context: Option<Value>) -> Job {
        self.context = context;
        self
    }

    pub fn ack_status(&self) -> AckStatus {
        *self.lock_status()
    }

    pub async fn ack(&self, all_up_to: bool) -> Result<(), AmqpError> {
        if !self.transition(AckStatus::Acked) {
            return Ok(());
        }
        self.channel.ack(self.delivery.delivery_tag, all_up_to).await
    }

    pub async fn nack(&self, all_up_to: bool, requeue: bool) -> Result<(), AmqpError> {
        if !self.transition(AckStatus::Nacked) {
            return Ok(());
        }
        self.channel
            .nack(self.delivery.delivery_tag, all_up_to, requeue)
            .await
    }

    /// Claims the transition; returns false when already settled.
    fn transition(&self, to: AckStatus) -> bool {
        let mut status = self.lock_status();
        if *status != AckStatus::Pending {
            return false;
        }
        *status = to;
        true
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, AckStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Declaration spec for a consumer.
#[derive(Debug, Clone, Default)]
pub struct ConsumerSpec {
    pub channel_name: Option<String>,
    /// Queue to consume from; an empty string asks the broker for a generated
    /// (exclusive) queue name.
    pub queue_name: String,
    pub exchange_name: Option<String>,
    pub routing_patterns: Vec<String>,
    pub queue_options: QueueOptions,
    pub consume_options: ConsumeOptions,
}

struct ConsumerState {
    asserted_queue: String,
    consumer_tag: Option<String>,
}

/// Handle to a declared consumer.
pub struct Consumer {
    channel: Arc<ChannelWrapper>,
    state: Arc<Mutex<ConsumerState>>,
    hook_id: u64,
    cancelled: Arc<AtomicBool>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer").finish_non_exhaustive()
    }
}

impl Consumer {
    /// Declares a consumer. The spec is validated here; the broker work runs
    /// as a setup hook on the spec's channel (immediately when already bound).
    pub async fn declare(
        transport: &Transport,
        spec: ConsumerSpec,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Consumer, AmqpError> {
        if !spec.routing_patterns.is_empty() && spec.exchange_name.is_none() {
            return Err(AmqpError::InvalidDeclaration(
                "consumer with routing patterns must have exchange_name specified".to_owned(),
            ));
        }
        if spec.queue_name.is_empty() && spec.exchange_name.is_none() {
            return Err(AmqpError::InvalidDeclaration(
                "consumer on a generated queue must have exchange_name specified".to_owned(),
            ));
        }

        let channel =
            transport.add_channel(spec.channel_name.as_deref().unwrap_or(DEFAULT_CHANNEL));
        let state = Arc::new(Mutex::new(ConsumerState {
            asserted_queue: String::new(),
            consumer_tag: None,
        }));
        let cancelled = Arc::new(AtomicBool::new(false));

        let weak = Arc::downgrade(&channel);
        let hook_spec = spec.clone();
        let hook_state = state.clone();
        let hook_cancelled = cancelled.clone();
        let hook_handler = handler.clone();
        let hook_id = channel
            .add_setup(move || {
                let weak = weak.clone();
                let spec = hook_spec.clone();
                let state = hook_state.clone();
                let cancelled = hook_cancelled.clone();
                let handler = hook_handler.clone();
                async move {
                    let Some(channel) = weak.upgrade() else {
                        return Ok(());
                    };
                    init(channel, spec, state, cancelled, handler).await
                }
            })
            .await?;

        Ok(Consumer {
            channel,
            state,
            hook_id,
            cancelled,
        })
    }

    /// Name of the queue actually asserted; differs from the spec's when the
    /// broker generated it.
    pub fn asserted_queue(&self) -> String {
        self.lock_state().asserted_queue.clone()
    }

    pub fn consumer_tag(&self) -> Option<String> {
        self.lock_state().consumer_tag.clone()
    }

    /// Cancels the broker consumer and deregisters its initialization so a
    /// future reconnect does not resurrect it. Terminal: already-buffered
    /// deliveries are dropped and re-subscription needs a new declaration.
    pub async fn cancel(&self) -> Result<(), AmqpError> {
        let tag = self.lock_state().consumer_tag.clone();
        if let Some(tag) = tag {
            self.channel.cancel(&tag).await?;
        }
        self.channel.remove_setup(self.hook_id);
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConsumerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-bind initialization: assert, bind, consume, then spawn the dispatch
/// loop for the delivery stream.
async fn init(
    channel: Arc<ChannelWrapper>,
    spec: ConsumerSpec,
    state: Arc<Mutex<ConsumerState>>,
    cancelled: Arc<AtomicBool>,
    handler: Arc<dyn MessageHandler>,
) -> Result<(), AmqpError> {
    let asserted = channel
        .assert_queue(&spec.queue_name, spec.queue_options.clone())
        .await?;

    if let Some(exchange_name) = &spec.exchange_name {
        for pattern in &spec.routing_patterns {
            channel.bind_queue(&asserted, exchange_name, pattern).await?;
        }

        if spec.queue_name.is_empty() {
            // Self-bind generated queues as their own routing key so they can
            // be addressed directly through the exchange.
            channel.bind_queue(&asserted, exchange_name, &asserted).await?;
        }
    }

    let stream = channel
        .consume(&asserted, spec.consume_options.clone())
        .await?;

    {
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        state.asserted_queue = asserted.clone();
        state.consumer_tag = Some(stream.consumer_tag.clone());
    }

    debug!(
        queue = asserted,
        channel = channel.name(),
        consumer_tag = stream.consumer_tag,
        "ready to consume"
    );

    tokio::spawn(dispatch_loop(
        channel.clone(),
        stream.deliveries,
        handler,
        cancelled,
        spec.consume_options.no_ack,
        asserted,
    ));

    Ok(())
}

async fn dispatch_loop(
    channel: Arc<ChannelWrapper>,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    handler: Arc<dyn MessageHandler>,
    cancelled: Arc<AtomicBool>,
    no_ack: bool,
    queue: String,
) {
    let tracer = global::tracer("amqp consumer");

    // End of stream is broker-side cancellation, a quiet no-op.
    while let Some(delivery) = deliveries.recv().await {
        if cancelled.load(Ordering::SeqCst) {
            break;
        }

        let kind = delivery
            .properties
            .kind
            .clone()
            .unwrap_or_else(|| "msg".to_owned());
        let (_ctx, mut span) = otel::new_span(&delivery.properties, &tracer, &kind);

        debug!(queue, kind, "received message");

        // Strict decode: only a `{payload, context}` object is accepted, so a
        // literal `null` body lands in the error arm as well.
        let envelope: Envelope = match serde_json::from_slice(&delivery.data) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    queue,
                    error = err.to_string(),
                    "malformed message dropped from queue"
                );
                span.set_status(Status::Error {
                    description: Cow::from("malformed message"),
                });
                if let Err(err) = channel.nack(delivery.delivery_tag, false, false).await {
                    error!(error = err.to_string(), "error nacking malformed message");
                }
                continue;
            }
        };

        let job = Job::new(channel.clone(), delivery, envelope.context, no_ack);
        match handler.handle(envelope.payload, job).await {
            Ok(_) => span.set_status(Status::Ok),
            Err(err) => {
                error!(queue, error = err.message, "handler failure");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("handler failure"),
                });
            }
        }
    }
}
