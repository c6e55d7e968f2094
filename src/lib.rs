// Copyright (c) 2025, The Amqp Transport Authors
// MIT License
// All rights reserved.

//! # AMQP Transport
//!
//! A messaging transport for RabbitMQ built on top of [lapin]. Logical
//! channels survive reconnects by replaying their queued setup hooks, and
//! three fabrics cover the usual shapes on top of them: routed
//! producer/consumer pairs, a correlated command protocol and fanout
//! publish/subscribe.

mod otel;
#[cfg(test)]
mod testing;

pub mod channel;
pub mod command;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod producer;
pub mod pubsub;
pub mod queue;
pub mod transport;

pub use config::{ConnectionSettings, TransportSettings};
pub use transport::Transport;
