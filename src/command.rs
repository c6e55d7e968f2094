// Copyright (c) 2025, The Amqp Transport Authors
// MIT License
// All rights reserved.

//! # Command Protocol
//!
//! Request/response over two one-way flows sharing one exchange: commands go
//! out on the `"command"` route, outcomes come back on the `"result"` and
//! `"error"` routes, paired by correlation id. Three roles are built from
//! producers and consumers: the sender, the server and the result recipient.

use crate::{
    consumer::{Consumer, ConsumerSpec, HandlerError, Job, MessageHandler},
    errors::AmqpError,
    exchange::ExchangeKind,
    message::SendOptions,
    producer::{CorrelationResolver, Producer, ProducerSpec},
    queue::{ConsumeOptions, QueueOptions},
    transport::Transport,
};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

pub const COMMAND_ROUTE: &str = "command";
pub const RESULT_ROUTE: &str = "result";
pub const ERROR_ROUTE: &str = "error";

/// Caller-pluggable recovery of the stored context behind a correlation id.
///
/// A failing or absent store degrades the delivery to a `None` context; it
/// never fails the delivery itself.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn context_by_id(&self, correlation_id: &str) -> Result<Option<Value>, HandlerError>;
}

fn command_queue(exchange_name: &str) -> String {
    format!("{exchange_name}.{COMMAND_ROUTE}")
}

/// Declaration spec for a command sender.
#[derive(Clone, Default)]
pub struct CommandSenderSpec {
    pub channel_name: Option<String>,
    pub resolver: Option<Arc<dyn CorrelationResolver>>,
}

/// Issues commands on the `"command"` route of one exchange.
pub struct CommandSender {
    producer: Producer,
}

impl CommandSender {
    pub async fn send_command(&self, payload: Value, opts: SendOptions) -> Result<(), AmqpError> {
        self.producer.send(payload, COMMAND_ROUTE, opts).await
    }
}

/// Declares a command sender on `exchange_name`.
///
/// Besides the producer, a setup hook asserts and binds the durable
/// `"<exchange>.command"` queue so the command stream has a home even before
/// any server attaches.
pub async fn create_command_sender(
    transport: &Transport,
    exchange_name: &str,
    spec: CommandSenderSpec,
) -> Result<CommandSender, AmqpError> {
    let producer = Producer::declare(
        transport,
        ProducerSpec {
            channel_name: spec.channel_name.clone(),
            exchange_name: exchange_name.to_owned(),
            exchange_type: ExchangeKind::Direct,
            resolver: spec.resolver,
        },
    )
    .await?;

    let channel = transport.add_channel(spec.channel_name.as_deref().unwrap_or_default());
    let weak = Arc::downgrade(&channel);
    let exchange = exchange_name.to_owned();
    channel
        .add_setup(move || {
            let weak = weak.clone();
            let exchange = exchange.clone();
            async move {
                let Some(channel) = weak.upgrade() else {
                    return Ok(());
                };
                let queue = command_queue(&exchange);
                channel
                    .assert_queue(&queue, QueueOptions::new().durable())
                    .await?;
                channel.bind_queue(&queue, &exchange, COMMAND_ROUTE).await
            }
        })
        .await?;

    Ok(CommandSender { producer })
}

/// Declaration spec for a command server.
#[derive(Clone)]
pub struct CommandServerSpec {
    pub channel_name: Option<String>,
    /// When false no result producer is configured: handler return values are
    /// discarded and acknowledging the delivery is entirely the handler's
    /// responsibility through its `Job`.
    pub produce_results: bool,
}

impl Default for CommandServerSpec {
    fn default() -> Self {
        CommandServerSpec {
            channel_name: None,
            produce_results: true,
        }
    }
}

/// Consumes the command stream and republishes outcomes under the same
/// correlation id.
pub struct CommandServer {
    consumer: Consumer,
}

impl CommandServer {
    pub async fn cancel(&self) -> Result<(), AmqpError> {
        self.consumer.cancel().await
    }
}

struct CommandServerHandler {
    inner: Arc<dyn MessageHandler>,
    producer: Option<Arc<Producer>>,
}

#[async_trait]
impl MessageHandler for CommandServerHandler {
    async fn handle(&self, payload: Value, job: Job) -> Result<Value, HandlerError> {
        let correlation_id = job.correlation_id().map(str::to_owned);

        let Some(producer) = &self.producer else {
            return self.inner.handle(payload, job).await;
        };

        let opts = SendOptions {
            correlation_id,
            ..SendOptions::default()
        };

        // Handler failures travel back over the error route instead of
        // crossing the broker boundary as exceptions.
        let publish = match self.inner.handle(payload, job).await {
            Ok(result) => producer.send(result, RESULT_ROUTE, opts).await,
            Err(err) => {
                let body = json!({
                    "message": err.message,
                    "details": err.details,
                });
                producer.send(body, ERROR_ROUTE, opts).await
            }
        };

        publish.map_err(|err| HandlerError::new(&err.to_string()))?;
        Ok(Value::Null)
    }
}

/// Declares a command server on `exchange_name`: a consumer on the durable
/// `"<exchange>.command"` queue whose handler outcome is republished to the
/// `"result"` or `"error"` route.
pub async fn create_command_server(
    transport: &Transport,
    exchange_name: &str,
    spec: CommandServerSpec,
    handler: Arc<dyn MessageHandler>,
) -> Result<CommandServer, AmqpError> {
    let producer = if spec.produce_results {
        Some(Arc::new(
            Producer::declare(
                transport,
                ProducerSpec {
                    channel_name: spec.channel_name.clone(),
                    exchange_name: exchange_name.to_owned(),
                    exchange_type: ExchangeKind::Direct,
                    resolver: None,
                },
            )
            .await?,
        ))
    } else {
        None
    };

    let consumer = Consumer::declare(
        transport,
        ConsumerSpec {
            channel_name: spec.channel_name,
            queue_name: command_queue(exchange_name),
            exchange_name: Some(exchange_name.to_owned()),
            routing_patterns: vec![COMMAND_ROUTE.to_owned()],
            queue_options: QueueOptions::new().durable(),
            consume_options: ConsumeOptions::default(),
        },
        Arc::new(CommandServerHandler {
            inner: handler,
            producer,
        }),
    )
    .await?;

    Ok(CommandServer { consumer })
}

/// Declaration spec for a command result recipient.
#[derive(Clone, Default)]
pub struct CommandResultRecipientSpec {
    pub channel_name: Option<String>,
    pub context_store: Option<Arc<dyn ContextStore>>,
}

/// Consumes the result and error streams of one exchange.
pub struct CommandResultRecipient {
    pub result: Consumer,
    pub error: Consumer,
}

struct RecipientHandler {
    store: Option<Arc<dyn ContextStore>>,
    inner: Arc<dyn MessageHandler>,
}

#[async_trait]
impl MessageHandler for RecipientHandler {
    async fn handle(&self, payload: Value, job: Job) -> Result<Value, HandlerError> {
        let context = recover_context(&self.store, job.correlation_id()).await;
        self.inner.handle(payload, job.with_context(context)).await
    }
}

async fn recover_context(
    store: &Option<Arc<dyn ContextStore>>,
    correlation_id: Option<&str>,
) -> Option<Value> {
    let (Some(store), Some(correlation_id)) = (store, correlation_id) else {
        return None;
    };

    match store.context_by_id(correlation_id).await {
        Ok(context) => context,
        Err(err) => {
            warn!(
                correlation_id,
                error = err.message,
                "error while retrieving context"
            );
            None
        }
    }
}

/// Declares the result recipient: one `no_ack` consumer per outcome stream
/// (`"<exchange>.result"`, `"<exchange>.error"`). The correlation id on each
/// delivery is resolved to a stored context before the matching handler runs.
pub async fn create_command_result_recipient(
    transport: &Transport,
    exchange_name: &str,
    spec: CommandResultRecipientSpec,
    result_handler: Arc<dyn MessageHandler>,
    error_handler: Arc<dyn MessageHandler>,
) -> Result<CommandResultRecipient, AmqpError> {
    let result = declare_recipient_consumer(
        transport,
        exchange_name,
        &spec,
        RESULT_ROUTE,
        result_handler,
    )
    .await?;
    let error = declare_recipient_consumer(
        transport,
        exchange_name,
        &spec,
        ERROR_ROUTE,
        error_handler,
    )
    .await?;

    Ok(CommandResultRecipient { result, error })
}

async fn declare_recipient_consumer(
    transport: &Transport,
    exchange_name: &str,
    spec: &CommandResultRecipientSpec,
    route: &str,
    handler: Arc<dyn MessageHandler>,
) -> Result<Consumer, AmqpError> {
    Consumer::declare(
        transport,
        ConsumerSpec {
            channel_name: spec.channel_name.clone(),
            queue_name: format!("{exchange_name}.{route}"),
            exchange_name: Some(exchange_name.to_owned()),
            routing_patterns: vec![route.to_owned()],
            queue_options: QueueOptions::default(),
            // Outcome streams are fire-and-forget notifications.
            consume_options: ConsumeOptions::new().no_ack(),
        },
        Arc::new(RecipientHandler {
            store: spec.context_store.clone(),
            inner: handler,
        }),
    )
    .await
}
