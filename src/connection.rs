// Copyright (c) 2025, The Amqp Transport Authors
// MIT License
// All rights reserved.

//! # Broker Connection
//!
//! The lapin-backed side of the transport: establishing the connection,
//! minting physical channels for the wrappers to bind and adapting every
//! channel operation onto lapin's `basic.*` calls.

use crate::{
    channel::{AmqpChannel, ChannelLifecycle, ConsumerStream},
    config::ConnectionSettings,
    errors::AmqpError,
    exchange::ExchangeKind,
    message::{Delivery, MessageProperties, JSON_CONTENT_TYPE},
    otel,
    queue::{ConsumeOptions, QueueOptions},
    transport::ChannelFactory,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRecoverOptions, BasicRejectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
        QueuePurgeOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use opentelemetry::Context;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// An established broker connection that mints physical channels.
pub struct LapinConnection {
    connection: Connection,
    lifecycle: broadcast::Sender<ChannelLifecycle>,
}

/// Connects to the broker described by `settings`.
///
/// A connection-level error notifies every channel minted from this
/// connection, first with the error and then with a close.
pub async fn connect(settings: &ConnectionSettings) -> Result<LapinConnection, AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(settings.app_name.clone()));

    let connection = match Connection::connect(&settings.uri(), options).await {
        Ok(connection) => connection,
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            return Err(AmqpError::ConnectionError);
        }
    };
    debug!("amqp connected");

    let (lifecycle, _) = broadcast::channel(16);
    let notifier = lifecycle.clone();
    connection.on_error(move |err| {
        notify_failure(&notifier, err.to_string());
    });

    Ok(LapinConnection {
        connection,
        lifecycle,
    })
}

/// Failures surface as an error followed by a close, the order the wrapper's
/// lifecycle watcher expects.
fn notify_failure(events: &broadcast::Sender<ChannelLifecycle>, error: String) {
    let _ = events.send(ChannelLifecycle::Error(error));
    let _ = events.send(ChannelLifecycle::Closed);
}

/// Forwards connection-scoped events to one channel's subscribers; a closed
/// connection takes its channels with it.
async fn relay_events(
    mut from: broadcast::Receiver<ChannelLifecycle>,
    to: broadcast::Sender<ChannelLifecycle>,
) {
    while let Ok(event) = from.recv().await {
        let closed = matches!(event, ChannelLifecycle::Closed);
        if to.send(event).is_err() || closed {
            break;
        }
    }
}

impl LapinConnection {
    pub async fn close(&self) -> Result<(), AmqpError> {
        if let Err(err) = self.connection.close(200, "closing").await {
            error!(error = err.to_string(), "error closing the connection");
            return Err(AmqpError::ConnectionError);
        }
        let _ = self.lifecycle.send(ChannelLifecycle::Closed);
        Ok(())
    }
}

#[async_trait]
impl ChannelFactory for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.connection.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                // A channel-scoped failure (e.g. PRECONDITION_FAILED on a
                // redeclare) closes only this channel; the connection-level
                // handler never fires for it.
                let (lifecycle, _) = broadcast::channel(16);
                let notifier = lifecycle.clone();
                channel.on_error(move |err| {
                    notify_failure(&notifier, err.to_string());
                });
                tokio::spawn(relay_events(self.lifecycle.subscribe(), lifecycle.clone()));
                Ok(Arc::new(LapinChannel { channel, lifecycle }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }
}

/// One physical lapin channel.
struct LapinChannel {
    channel: Channel,
    lifecycle: broadcast::Sender<ChannelLifecycle>,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn queue_declare(
        &self,
        queue: String,
        options: QueueOptions,
    ) -> Result<String, AmqpError> {
        match self
            .channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    passive: options.passive,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(declared) => Ok(declared.name().to_string()),
            Err(err) => {
                error!(error = err.to_string(), queue, "error declaring queue");
                Err(AmqpError::DeclareQueueError(queue))
            }
        }
    }

    async fn queue_purge(&self, queue: String) -> Result<(), AmqpError> {
        if let Err(err) = self
            .channel
            .queue_purge(&queue, QueuePurgeOptions::default())
            .await
        {
            error!(error = err.to_string(), queue, "error purging queue");
            return Err(AmqpError::PurgeQueueError(queue));
        }
        Ok(())
    }

    async fn queue_delete(&self, queue: String) -> Result<(), AmqpError> {
        if let Err(err) = self
            .channel
            .queue_delete(&queue, QueueDeleteOptions::default())
            .await
        {
            error!(error = err.to_string(), queue, "error deleting queue");
            return Err(AmqpError::DeleteQueueError(queue));
        }
        Ok(())
    }

    async fn exchange_declare(
        &self,
        exchange: String,
        kind: ExchangeKind,
    ) -> Result<(), AmqpError> {
        if let Err(err) = self
            .channel
            .exchange_declare(
                &exchange,
                kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            error!(error = err.to_string(), exchange, "error declaring exchange");
            return Err(AmqpError::DeclareExchangeError(exchange));
        }
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: String,
        exchange: String,
        routing_key: String,
    ) -> Result<(), AmqpError> {
        if let Err(err) = self
            .channel
            .queue_bind(
                &queue,
                &exchange,
                &routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            error!(
                error = err.to_string(),
                queue, exchange, "error binding queue"
            );
            return Err(AmqpError::BindQueueError(queue, exchange));
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: String,
        routing_key: String,
        data: Vec<u8>,
        mut properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        otel::inject_context(&Context::current(), &mut properties);

        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        for (key, value) in &properties.headers {
            headers.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }

        let mut basic = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));
        if let Some(correlation_id) = properties.correlation_id {
            basic = basic.with_correlation_id(ShortString::from(correlation_id));
        }
        if let Some(kind) = properties.kind {
            basic = basic.with_type(ShortString::from(kind));
        }

        if let Err(err) = self
            .channel
            .basic_publish(
                &exchange,
                &routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &data,
                basic,
            )
            .await
        {
            error!(error = err.to_string(), exchange, "error publishing message");
            return Err(AmqpError::PublishingError);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: String,
        options: ConsumeOptions,
    ) -> Result<ConsumerStream, AmqpError> {
        let mut consumer = match self
            .channel
            .basic_consume(
                &queue,
                &options.consumer_tag.unwrap_or_default(),
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(error = err.to_string(), queue, "error starting consumer");
                return Err(AmqpError::ConsumerDeclarationError(queue));
            }
        };

        let consumer_tag = consumer.tag().to_string();
        let (sender, deliveries) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(received) = consumer.next().await {
                let delivery = match received {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        error!(error = err.to_string(), "error receiving delivery");
                        continue;
                    }
                };

                let forwarded = Delivery {
                    delivery_tag: delivery.delivery_tag,
                    exchange: delivery.exchange.to_string(),
                    routing_key: delivery.routing_key.to_string(),
                    data: delivery.data,
                    properties: extract_properties(&delivery.properties),
                };

                if sender.send(forwarded).is_err() {
                    break;
                }
            }
        });

        Ok(ConsumerStream {
            consumer_tag,
            deliveries,
        })
    }

    async fn cancel(&self, consumer_tag: String) -> Result<(), AmqpError> {
        if let Err(err) = self
            .channel
            .basic_cancel(&consumer_tag, BasicCancelOptions::default())
            .await
        {
            error!(error = err.to_string(), consumer_tag, "error cancelling consumer");
            return Err(AmqpError::CancelConsumerError(consumer_tag));
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error acking message");
                AmqpError::AckMessageError
            })
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error nacking message");
                AmqpError::NackMessageError
            })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error rejecting message");
                AmqpError::RejectMessageError
            })
    }

    async fn qos(&self, count: u16, global: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), count, "error setting qos");
                AmqpError::InternalError
            })
    }

    async fn recover(&self) -> Result<(), AmqpError> {
        self.channel
            .basic_recover(BasicRecoverOptions { requeue: true })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error recovering channel");
                AmqpError::RecoverError
            })
    }

    fn lifecycle(&self) -> broadcast::Receiver<ChannelLifecycle> {
        self.lifecycle.subscribe()
    }
}

/// Maps lapin's typed properties onto the transport's flat metadata. Header
/// values that are not strings are skipped.
fn extract_properties(properties: &BasicProperties) -> MessageProperties {
    let mut headers = BTreeMap::new();
    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            match value.as_long_string() {
                Some(value) => {
                    headers.insert(key.to_string(), value.to_string());
                }
                None => {
                    warn!(header = key.to_string(), "skipping non-string header");
                }
            }
        }
    }

    MessageProperties {
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(ToString::to_string),
        kind: properties.kind().as_ref().map(ToString::to_string),
        headers,
    }
}
