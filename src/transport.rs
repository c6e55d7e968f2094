// Copyright (c) 2025, The Amqp Transport Authors
// MIT License
// All rights reserved.

//! # Transport
//!
//! The transport owns the registry of logical channels and drives their
//! lifecycle from connection notifications: on `connected` it creates one
//! physical channel per registered wrapper and binds each; on `closed` it
//! resets every wrapper and waits for the next connect. Readiness is signalled
//! through a watch channel with deliver-once semantics per transition.

use crate::{
    channel::{AmqpChannel, ChannelWrapper},
    errors::AmqpError,
    queue::QueueDescriptor,
    TransportSettings,
};
use async_trait::async_trait;
use futures_util::future::try_join_all;
#[cfg(test)]
use mockall::automock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error};

/// Name of the channel created with every transport.
pub const DEFAULT_CHANNEL: &str = "default";

/// Consumed from the connection collaborator: creates physical channels on a
/// live connection. Connect/reconnect policy stays on the collaborator side.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;
}

/// Messaging transport instance.
///
/// Every component that needs channel lookup receives this by reference; there
/// is no process-wide registry.
pub struct Transport {
    settings: TransportSettings,
    channels: Mutex<HashMap<String, Arc<ChannelWrapper>>>,
    /// Queue name asserted per `(exchange, route)` on the last bind; this is
    /// how callers address broker-generated queues.
    queue_names: Arc<Mutex<HashMap<(String, String), String>>>,
    ready: watch::Sender<bool>,
    closed: broadcast::Sender<()>,
}

impl Transport {
    pub fn new(settings: TransportSettings) -> Arc<Transport> {
        let (ready, _) = watch::channel(false);
        let (closed, _) = broadcast::channel(4);

        let transport = Transport {
            settings,
            channels: Mutex::new(HashMap::new()),
            queue_names: Arc::new(Mutex::new(HashMap::new())),
            ready,
            closed,
        };
        transport.add_channel(DEFAULT_CHANNEL);
        Arc::new(transport)
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Looks up a logical channel; errors on unknown names.
    pub fn channel(&self, name: &str) -> Result<Arc<ChannelWrapper>, AmqpError> {
        let name = if name.is_empty() { DEFAULT_CHANNEL } else { name };
        self.lock_channels()
            .get(name)
            .cloned()
            .ok_or_else(|| AmqpError::InvalidDeclaration(format!("channel `{name}` does not exist")))
    }

    /// Returns the named logical channel, creating it when absent.
    ///
    /// Channels added after a connect bind on the next reconnect.
    pub fn add_channel(&self, name: &str) -> Arc<ChannelWrapper> {
        let name = if name.is_empty() { DEFAULT_CHANNEL } else { name };
        self.lock_channels()
            .entry(name.to_owned())
            .or_insert_with(|| ChannelWrapper::new(name))
            .clone()
    }

    /// Registers a bulk queue declaration, processed once per bind of the
    /// named channel: the exchange is asserted, then every route's queue is
    /// asserted and bound.
    pub async fn add_queue(
        &self,
        channel_name: &str,
        descriptor: QueueDescriptor,
    ) -> Result<u64, AmqpError> {
        let channel = self.add_channel(channel_name);
        let weak = Arc::downgrade(&channel);
        let queue_names = self.queue_names.clone();

        channel
            .add_setup(move || {
                let weak = weak.clone();
                let descriptor = descriptor.clone();
                let queue_names = queue_names.clone();
                async move {
                    let Some(channel) = weak.upgrade() else {
                        return Ok(());
                    };

                    debug!(exchange = descriptor.exchange, "asserting exchange");
                    channel
                        .assert_exchange(&descriptor.exchange, descriptor.exchange_type)
                        .await?;

                    for route in &descriptor.routes {
                        let queue_name = descriptor.queue_name(route);
                        let asserted = channel
                            .assert_queue(&queue_name, descriptor.options.clone())
                            .await?;
                        channel
                            .bind_queue(&asserted, &descriptor.exchange, route)
                            .await?;
                        queue_names
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert((descriptor.exchange.clone(), route.clone()), asserted);
                    }

                    debug!(
                        exchange = descriptor.exchange,
                        routes = descriptor.routes.len(),
                        "exchange routes asserted"
                    );
                    Ok(())
                }
            })
            .await
    }

    /// Queue name asserted for `exchange`/`route` by the last bind of its
    /// descriptor. Broker-generated names change on every rebind, so callers
    /// should look them up rather than cache them.
    pub fn queue_name(&self, exchange: &str, route: &str) -> Option<String> {
        self.queue_names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(exchange.to_owned(), route.to_owned()))
            .cloned()
    }

    /// Reacts to the connection collaborator's `connected` event: creates one
    /// physical channel per logical channel, binds each (running its setup
    /// hooks), then signals readiness. Channels bind concurrently; hook order
    /// is only guaranteed within a channel.
    pub async fn handle_connected(&self, factory: &dyn ChannelFactory) -> Result<(), AmqpError> {
        let channels: Vec<Arc<ChannelWrapper>> = self.lock_channels().values().cloned().collect();

        let binds = channels.iter().map(|channel| async {
            debug!(channel = channel.name(), "initializing channel");
            let physical = factory.create_channel().await?;
            channel.bind(physical, &self.settings).await
        });

        if let Err(err) = try_join_all(binds).await {
            error!(error = err.to_string(), "error during channel init");
            return Err(err);
        }

        self.ready.send_replace(true);
        Ok(())
    }

    /// Reacts to the connection collaborator's `closed` event: clears every
    /// channel binding and notifies observers.
    pub fn handle_closed(&self) {
        self.ready.send_replace(false);
        for channel in self.lock_channels().values() {
            channel.reset();
        }
        let _ = self.closed.send(());
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Resolves once the transport has bound all channels after a connect.
    pub async fn get_ready(&self) {
        let mut ready = self.ready.subscribe();
        // Closed sender means the transport is gone; nothing left to await.
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// Subscription to connection-closed notifications.
    pub fn on_closed(&self) -> broadcast::Receiver<()> {
        self.closed.subscribe()
    }

    fn lock_channels(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ChannelWrapper>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
