// Copyright (c) 2025, The Amqp Transport Authors
// MIT License
// All rights reserved.

//! # Channel Management
//!
//! This module defines the seam to the physical broker channel and the
//! `ChannelWrapper` that owns one logical channel's lifecycle: binding to a
//! freshly created physical channel, applying prefetch settings, draining
//! queued setup hooks in registration order and forwarding standard
//! operations. The wrapper re-arms on every reconnect by replaying its hooks.

use crate::{
    errors::AmqpError,
    exchange::ExchangeKind,
    message::{Delivery, MessageProperties},
    queue::{ConsumeOptions, QueueOptions},
    TransportSettings,
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
#[cfg(test)]
use mockall::automock;
use std::future::Future;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Lifecycle notifications emitted by a physical channel.
#[derive(Debug, Clone)]
pub enum ChannelLifecycle {
    Error(String),
    Closed,
}

/// Events broadcast by a `ChannelWrapper` to its observers.
///
/// `Close.errored` tells a higher-level policy whether the close followed an
/// error, so it can decide to force-close the whole connection.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Error(String),
    Close { errored: bool },
}

/// Consumer handle returned by [`AmqpChannel::consume`]: the broker-assigned
/// tag plus the stream of deliveries.
pub struct ConsumerStream {
    pub consumer_tag: String,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

/// The physical-channel collaborator.
///
/// Owned exclusively by one `ChannelWrapper` at a time and replaced wholesale
/// on each reconnect. The lapin implementation lives in the `connection`
/// module; tests substitute mocks or fakes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Asserts a queue and returns its name (the broker-generated one when
    /// `queue` is empty).
    async fn queue_declare(
        &self,
        queue: String,
        options: QueueOptions,
    ) -> Result<String, AmqpError>;

    async fn queue_purge(&self, queue: String) -> Result<(), AmqpError>;

    async fn queue_delete(&self, queue: String) -> Result<(), AmqpError>;

    async fn exchange_declare(
        &self,
        exchange: String,
        kind: ExchangeKind,
    ) -> Result<(), AmqpError>;

    async fn queue_bind(
        &self,
        queue: String,
        exchange: String,
        routing_key: String,
    ) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: String,
        routing_key: String,
        data: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), AmqpError>;

    async fn consume(
        &self,
        queue: String,
        options: ConsumeOptions,
    ) -> Result<ConsumerStream, AmqpError>;

    async fn cancel(&self, consumer_tag: String) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool)
        -> Result<(), AmqpError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn qos(&self, count: u16, global: bool) -> Result<(), AmqpError>;

    async fn recover(&self) -> Result<(), AmqpError>;

    /// Subscription to error/close notifications for this physical channel.
    fn lifecycle(&self) -> broadcast::Receiver<ChannelLifecycle>;
}

type SetupFuture = BoxFuture<'static, Result<(), AmqpError>>;
type SetupHook = Arc<dyn Fn() -> SetupFuture + Send + Sync>;

struct ChannelState {
    channel: Option<Arc<dyn AmqpChannel>>,
    prefetch_count: u16,
    prefetch_global: bool,
    hooks: Vec<(u64, SetupHook)>,
    /// Index of the next hook the drain driver will run for the current bind
    /// cycle; reset on every bind so reconnects replay the whole list.
    next_to_run: usize,
}

/// One logical channel.
///
/// Holds the exclusive slot for the current physical channel, the effective
/// prefetch settings and the ordered setup-hook list. All standard operations
/// forward to the physical channel and fail with
/// [`AmqpError::NotConnected`] while no channel is bound.
pub struct ChannelWrapper {
    name: String,
    state: Mutex<ChannelState>,
    /// Serializes hook execution: one drain driver at a time, so hooks run
    /// strictly in registration order and never interleave.
    drain_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ChannelEvent>,
    hook_seq: AtomicU64,
}

impl ChannelWrapper {
    pub fn new(name: &str) -> Arc<ChannelWrapper> {
        let (events, _) = broadcast::channel(16);
        Arc::new(ChannelWrapper {
            name: name.to_owned(),
            state: Mutex::new(ChannelState {
                channel: None,
                prefetch_count: crate::config::DEFAULT_PREFETCH,
                prefetch_global: false,
                hooks: vec![],
                next_to_run: 0,
            }),
            drain_lock: tokio::sync::Mutex::new(()),
            events,
            hook_seq: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_bound(&self) -> bool {
        self.lock_state().channel.is_some()
    }

    /// Effective `(count, global)` prefetch pair, resolved at the last bind.
    pub fn prefetch_settings(&self) -> (u16, bool) {
        let state = self.lock_state();
        (state.prefetch_count, state.prefetch_global)
    }

    /// Subscribes to this channel's error/close events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Binds a freshly created physical channel.
    ///
    /// Installs lifecycle listeners, resolves the effective prefetch from the
    /// transport settings, applies it, then runs every queued setup hook
    /// sequentially. A failing hook aborts the remaining hooks and the bind.
    pub async fn bind(
        self: &Arc<Self>,
        physical: Arc<dyn AmqpChannel>,
        settings: &TransportSettings,
    ) -> Result<(), AmqpError> {
        let (count, global) = settings.prefetch_for(&self.name);

        let lifecycle = physical.lifecycle();
        {
            let mut state = self.lock_state();
            state.channel = Some(physical.clone());
            state.prefetch_count = count;
            state.prefetch_global = global;
            state.next_to_run = 0;
        }
        self.watch_lifecycle(lifecycle);

        debug!(
            channel = self.name,
            count, global, "setting prefetch on channel"
        );
        physical
            .qos(count, global)
            .await
            .map_err(|_| AmqpError::QoSDeclarationError(self.name.clone()))?;

        self.drain_hooks().await?;
        debug!(channel = self.name, "channel ready");
        Ok(())
    }

    fn watch_lifecycle(self: &Arc<Self>, mut lifecycle: broadcast::Receiver<ChannelLifecycle>) {
        let wrapper = Arc::clone(self);
        tokio::spawn(async move {
            let mut errored = false;
            while let Ok(event) = lifecycle.recv().await {
                match event {
                    ChannelLifecycle::Error(err) => {
                        warn!(channel = wrapper.name, error = err, "channel error");
                        errored = true;
                        let _ = wrapper.events.send(ChannelEvent::Error(err));
                    }
                    ChannelLifecycle::Closed => {
                        debug!(channel = wrapper.name, "channel closed");
                        wrapper.reset();
                        let _ = wrapper.events.send(ChannelEvent::Close { errored });
                        break;
                    }
                }
            }
        });
    }

    /// Clears the bound physical channel; operations fail fast until the next
    /// bind.
    pub fn reset(&self) {
        self.lock_state().channel = None;
    }

    /// Appends a setup hook and returns its registration id.
    ///
    /// Hooks registered before the channel is bound run once during binding,
    /// in registration order. Hooks registered while bound run immediately,
    /// still strictly after every earlier hook.
    pub async fn add_setup<F, Fut>(&self, hook: F) -> Result<u64, AmqpError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AmqpError>> + Send + 'static,
    {
        let id = self.hook_seq.fetch_add(1, Ordering::Relaxed);
        let bound = {
            let mut state = self.lock_state();
            state
                .hooks
                .push((id, Arc::new(move || hook().boxed()) as SetupHook));
            state.channel.is_some()
        };

        if bound {
            self.drain_hooks().await?;
        }

        Ok(id)
    }

    /// Deregisters a setup hook so a future rebind does not replay it.
    pub fn remove_setup(&self, id: u64) {
        let mut state = self.lock_state();
        if let Some(pos) = state.hooks.iter().position(|(hook_id, _)| *hook_id == id) {
            state.hooks.remove(pos);
            if pos < state.next_to_run {
                state.next_to_run -= 1;
            }
        }
    }

    /// Runs pending hooks one at a time, each settling before the next
    /// starts. The first failure aborts the remainder for this bind cycle.
    async fn drain_hooks(&self) -> Result<(), AmqpError> {
        let _guard = self.drain_lock.lock().await;
        loop {
            let hook = {
                let mut state = self.lock_state();
                if state.channel.is_none() || state.next_to_run >= state.hooks.len() {
                    return Ok(());
                }
                let hook = state.hooks[state.next_to_run].1.clone();
                state.next_to_run += 1;
                hook
            };
            hook().await?;
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        self.lock_state()
            .channel
            .clone()
            .ok_or_else(|| AmqpError::NotConnected(self.name.clone()))
    }

    pub async fn assert_queue(
        &self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<String, AmqpError> {
        self.current()?.queue_declare(queue.to_owned(), options).await
    }

    pub async fn purge_queue(&self, queue: &str) -> Result<(), AmqpError> {
        self.current()?.queue_purge(queue.to_owned()).await
    }

    pub async fn delete_queue(&self, queue: &str) -> Result<(), AmqpError> {
        self.current()?.queue_delete(queue.to_owned()).await
    }

    pub async fn assert_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
    ) -> Result<(), AmqpError> {
        self.current()?
            .exchange_declare(exchange.to_owned(), kind)
            .await
    }

    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        debug!(
            queue,
            exchange, routing_key, "binding queue to exchange"
        );
        self.current()?
            .queue_bind(queue.to_owned(), exchange.to_owned(), routing_key.to_owned())
            .await
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        data: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        self.current()?
            .publish(
                exchange.to_owned(),
                routing_key.to_owned(),
                data,
                properties,
            )
            .await
    }

    /// Publishes through the default exchange straight to a queue.
    pub async fn send_to_queue(
        &self,
        queue: &str,
        data: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        self.publish("", queue, data, properties).await
    }

    pub async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<ConsumerStream, AmqpError> {
        self.current()?.consume(queue.to_owned(), options).await
    }

    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.current()?.cancel(consumer_tag.to_owned()).await
    }

    pub async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.current()?.ack(delivery_tag, multiple).await
    }

    pub async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.current()?.nack(delivery_tag, multiple, requeue).await
    }

    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.current()?.reject(delivery_tag, requeue).await
    }

    /// Applies a new prefetch to the bound channel and records it as the
    /// effective setting.
    pub async fn prefetch(&self, count: u16, global: bool) -> Result<(), AmqpError> {
        let channel = self.current()?;
        channel
            .qos(count, global)
            .await
            .map_err(|_| AmqpError::QoSDeclarationError(self.name.clone()))?;
        let mut state = self.lock_state();
        state.prefetch_count = count;
        state.prefetch_global = global;
        Ok(())
    }

    pub async fn recover(&self) -> Result<(), AmqpError> {
        self.current()?.recover().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeChannel;
    use crate::TransportSettings;
    use mockall::predicate::eq;
    use std::collections::HashMap;

    fn settings_with_alpha() -> TransportSettings {
        let mut channel_config = HashMap::new();
        channel_config.insert(
            "alpha".to_owned(),
            crate::config::ChannelSettings {
                prefetch: Some(crate::config::PrefetchSettings {
                    count: Some(3),
                    global: true,
                }),
            },
        );
        TransportSettings {
            prefetch: Some(2),
            channel_config,
        }
    }

    #[tokio::test]
    async fn operations_fail_fast_when_unbound() {
        let wrapper = ChannelWrapper::new("default");
        let err = wrapper
            .assert_queue("some.queue", QueueOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::NotConnected("default".to_owned()));

        let err = wrapper.ack(1, false).await.unwrap_err();
        assert_eq!(err, AmqpError::NotConnected("default".to_owned()));
    }

    #[tokio::test]
    async fn bind_applies_resolved_prefetch() {
        let mut mock = MockAmqpChannel::new();
        let (lifecycle_tx, _) = broadcast::channel(1);
        let tx = lifecycle_tx.clone();
        mock.expect_lifecycle().returning(move || tx.subscribe());
        mock.expect_qos()
            .with(eq(3u16), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let wrapper = ChannelWrapper::new("alpha");
        wrapper
            .bind(Arc::new(mock), &settings_with_alpha())
            .await
            .unwrap();

        assert_eq!(wrapper.prefetch_settings(), (3, true));
        assert!(wrapper.is_bound());
    }

    #[tokio::test]
    async fn default_prefetch_is_one_non_global() {
        let wrapper = ChannelWrapper::new("bravo");
        let fake = FakeChannel::new();
        wrapper
            .bind(fake.clone(), &TransportSettings::default())
            .await
            .unwrap();
        assert_eq!(wrapper.prefetch_settings(), (1, false));
    }

    #[tokio::test]
    async fn pre_bind_hooks_run_sequentially_in_registration_order() {
        let wrapper = ChannelWrapper::new("default");
        let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));

        // The first hook sleeps before logging so interleaved execution would
        // reorder the entries.
        let slow = log.clone();
        wrapper
            .add_setup(move || {
                let slow = slow.clone();
                async move {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    slow.lock().unwrap().push("a");
                    Ok(())
                }
            })
            .await
            .unwrap();

        let fast = log.clone();
        wrapper
            .add_setup(move || {
                let fast = fast.clone();
                async move {
                    fast.lock().unwrap().push("b");
                    Ok(())
                }
            })
            .await
            .unwrap();

        let fake = FakeChannel::new();
        wrapper
            .bind(fake.clone(), &TransportSettings::default())
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn post_bind_hooks_run_immediately_after_pre_bind_hooks() {
        let wrapper = ChannelWrapper::new("default");
        let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));

        for name in ["a", "b"] {
            let log = log.clone();
            wrapper
                .add_setup(move || {
                    let log = log.clone();
                    async move {
                        log.lock().unwrap().push(name);
                        Ok(())
                    }
                })
                .await
                .unwrap();
        }

        let fake = FakeChannel::new();
        wrapper
            .bind(fake.clone(), &TransportSettings::default())
            .await
            .unwrap();

        for name in ["c", "d"] {
            let log = log.clone();
            wrapper
                .add_setup(move || {
                    let log = log.clone();
                    async move {
                        log.lock().unwrap().push(name);
                        Ok(())
                    }
                })
                .await
                .unwrap();
        }

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn failing_hook_aborts_remaining_hooks_and_bind() {
        let wrapper = ChannelWrapper::new("default");
        let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));

        let first = log.clone();
        wrapper
            .add_setup(move || {
                let first = first.clone();
                async move {
                    first.lock().unwrap().push("first");
                    Ok(())
                }
            })
            .await
            .unwrap();

        wrapper
            .add_setup(|| async { Err(AmqpError::DeclareQueueError("broken".to_owned())) })
            .await
            .unwrap();

        let last = log.clone();
        wrapper
            .add_setup(move || {
                let last = last.clone();
                async move {
                    last.lock().unwrap().push("last");
                    Ok(())
                }
            })
            .await
            .unwrap();

        let fake = FakeChannel::new();
        let err = wrapper
            .bind(fake.clone(), &TransportSettings::default())
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::DeclareQueueError("broken".to_owned()));
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn removed_hooks_are_not_replayed_on_rebind() {
        let wrapper = ChannelWrapper::new("default");
        let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));

        let keep = log.clone();
        wrapper
            .add_setup(move || {
                let keep = keep.clone();
                async move {
                    keep.lock().unwrap().push("keep");
                    Ok(())
                }
            })
            .await
            .unwrap();

        let drop_log = log.clone();
        let removable = wrapper
            .add_setup(move || {
                let drop_log = drop_log.clone();
                async move {
                    drop_log.lock().unwrap().push("drop");
                    Ok(())
                }
            })
            .await
            .unwrap();

        let fake = FakeChannel::new();
        wrapper
            .bind(fake.clone(), &TransportSettings::default())
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["keep", "drop"]);

        wrapper.remove_setup(removable);
        wrapper.reset();
        log.lock().unwrap().clear();

        let fake = FakeChannel::new();
        wrapper
            .bind(fake.clone(), &TransportSettings::default())
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["keep"]);
    }

    #[tokio::test]
    async fn close_event_clears_binding_and_reports_error_flag() {
        let wrapper = ChannelWrapper::new("default");
        let fake = FakeChannel::new();
        wrapper
            .bind(fake.clone(), &TransportSettings::default())
            .await
            .unwrap();

        let mut events = wrapper.subscribe();
        fake.emit(ChannelLifecycle::Error("boom".to_owned()));
        fake.emit(ChannelLifecycle::Closed);

        let mut errored_close = None;
        while let Ok(event) =
            tokio::time::timeout(std::time::Duration::from_secs(1), events.recv())
                .await
                .expect("event expected")
        {
            if let ChannelEvent::Close { errored } = event {
                errored_close = Some(errored);
                break;
            }
        }

        assert_eq!(errored_close, Some(true));
        assert!(!wrapper.is_bound());
    }
}
