// Copyright (c) 2025, The Amqp Transport Authors
// MIT License
// All rights reserved.

//! # Producers
//!
//! A `Producer` binds a send function to one exchange and stamps a
//! correlation id on every outgoing message. A `Router` generalizes it by
//! pre-asserting a fixed set of named routes before any send can succeed.

use crate::{
    channel::ChannelWrapper,
    errors::AmqpError,
    exchange::ExchangeKind,
    message::{Envelope, MessageProperties, SendOptions},
    queue::QueueOptions,
    transport::{Transport, DEFAULT_CHANNEL},
};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Caller-pluggable context-to-correlation-id resolution.
///
/// Absence of a resolver, or of a context on the send, yields no correlation
/// id. Id uniqueness scope and lifetime belong to the implementation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CorrelationResolver: Send + Sync {
    async fn resolve(&self, context: &Value) -> Option<String>;
}

/// Declaration spec for a producer.
#[derive(Clone, Default)]
pub struct ProducerSpec {
    pub channel_name: Option<String>,
    pub exchange_name: String,
    pub exchange_type: ExchangeKind,
    pub resolver: Option<Arc<dyn CorrelationResolver>>,
}

/// Send function bound to one exchange.
pub struct Producer {
    channel: Arc<ChannelWrapper>,
    exchange_name: String,
    resolver: Option<Arc<dyn CorrelationResolver>>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer").finish_non_exhaustive()
    }
}

impl Producer {
    /// Declares a producer: registers a setup hook asserting the exchange and
    /// returns the send handle.
    pub async fn declare(transport: &Transport, spec: ProducerSpec) -> Result<Producer, AmqpError> {
        if spec.exchange_name.is_empty() {
            return Err(AmqpError::InvalidDeclaration(
                "producer must have exchange_name specified".to_owned(),
            ));
        }

        let channel =
            transport.add_channel(spec.channel_name.as_deref().unwrap_or(DEFAULT_CHANNEL));

        let weak = Arc::downgrade(&channel);
        let exchange_name = spec.exchange_name.clone();
        let exchange_type = spec.exchange_type;
        channel
            .add_setup(move || {
                let weak = weak.clone();
                let exchange_name = exchange_name.clone();
                async move {
                    let Some(channel) = weak.upgrade() else {
                        return Ok(());
                    };
                    channel.assert_exchange(&exchange_name, exchange_type).await
                }
            })
            .await?;

        Ok(Producer {
            channel,
            exchange_name: spec.exchange_name,
            resolver: spec.resolver,
        })
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// Publishes `{payload, context}` to the exchange under `route`.
    ///
    /// The correlation id comes from `opts.correlation_id` when already
    /// resolved, otherwise from the declared resolver applied to
    /// `opts.context`; no resolver or no context means no id.
    pub async fn send(
        &self,
        payload: Value,
        route: &str,
        opts: SendOptions,
    ) -> Result<(), AmqpError> {
        let correlation_id = match opts.correlation_id {
            Some(id) => Some(id),
            None => self.resolve_correlation_id(opts.context.as_ref()).await,
        };

        debug!(
            exchange = self.exchange_name,
            route,
            correlation_id = correlation_id.as_deref().unwrap_or(""),
            "sending message"
        );

        let envelope = Envelope::new(payload, opts.context);
        let data = serde_json::to_vec(&envelope).map_err(|_| AmqpError::ParsePayloadError)?;

        let properties = MessageProperties {
            correlation_id,
            kind: opts.kind,
            ..MessageProperties::default()
        };

        self.channel
            .publish(&self.exchange_name, route, data, properties)
            .await
    }

    async fn resolve_correlation_id(&self, context: Option<&Value>) -> Option<String> {
        match (&self.resolver, context) {
            (Some(resolver), Some(context)) => resolver.resolve(context).await,
            _ => None,
        }
    }
}

/// Declaration spec for a router.
#[derive(Clone, Default)]
pub struct RouterSpec {
    pub channel_name: Option<String>,
    pub exchange_name: String,
    pub exchange_type: ExchangeKind,
    /// Named routes asserted up front; each gets a `"<exchange>.<route>"`
    /// queue bound to the exchange.
    pub routes: Vec<String>,
    pub queue_options: QueueOptions,
    pub resolver: Option<Arc<dyn CorrelationResolver>>,
}

/// Producer with a fixed set of pre-asserted named routes.
pub struct Router {
    producer: Producer,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").finish_non_exhaustive()
    }
}

impl Router {
    pub async fn declare(transport: &Transport, spec: RouterSpec) -> Result<Router, AmqpError> {
        if spec.routes.is_empty() {
            return Err(AmqpError::InvalidDeclaration(
                "router must have routes specified".to_owned(),
            ));
        }

        let producer = Producer::declare(
            transport,
            ProducerSpec {
                channel_name: spec.channel_name.clone(),
                exchange_name: spec.exchange_name.clone(),
                exchange_type: spec.exchange_type,
                resolver: spec.resolver.clone(),
            },
        )
        .await?;

        let channel = producer.channel.clone();
        let weak = Arc::downgrade(&channel);
        let exchange_name = spec.exchange_name.clone();
        let routes = spec.routes.clone();
        let queue_options = spec.queue_options.clone();
        channel
            .add_setup(move || {
                let weak = weak.clone();
                let exchange_name = exchange_name.clone();
                let routes = routes.clone();
                let queue_options = queue_options.clone();
                async move {
                    let Some(channel) = weak.upgrade() else {
                        return Ok(());
                    };
                    for route in &routes {
                        let queue_name = format!("{exchange_name}.{route}");
                        channel
                            .assert_queue(&queue_name, queue_options.clone())
                            .await?;
                        channel
                            .bind_queue(&queue_name, &exchange_name, route)
                            .await?;
                    }
                    Ok(())
                }
            })
            .await?;

        Ok(Router { producer })
    }

    /// Same correlation + send contract as [`Producer::send`].
    pub async fn send(
        &self,
        payload: Value,
        route: &str,
        opts: SendOptions,
    ) -> Result<(), AmqpError> {
        self.producer.send(payload, route, opts).await
    }
}
