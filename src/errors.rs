// Copyright (c) 2025, The Amqp Transport Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Transport
//!
//! This module provides the error types for transport operations. The
//! `AmqpError` enum covers connection and channel management, exchange and
//! queue declarations, publishing, consuming and acknowledgment handling.

use thiserror::Error;

/// Represents errors that can occur during AMQP transport operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Operation invoked while no physical channel is bound to the wrapper
    #[error("client is not connected to channel `{0}`")]
    NotConnected(String),

    /// A declaration spec was rejected before touching the broker
    #[error("invalid declaration: {0}")]
    InvalidDeclaration(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindQueueError(String, String),

    /// Error purging a queue
    #[error("failure to purge queue `{0}`")]
    PurgeQueueError(String),

    /// Error deleting a queue
    #[error("failure to delete queue `{0}`")]
    DeleteQueueError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error starting a consumer on a queue
    #[error("failure to declare consumer on queue `{0}`")]
    ConsumerDeclarationError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error recovering unacknowledged messages
    #[error("failure to recover channel")]
    RecoverError,
}
