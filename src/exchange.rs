// Copyright (c) 2025, The Amqp Transport Authors
// MIT License
// All rights reserved.

//! # Exchange Kinds
//!
//! Exchange types supported by the transport and their conversion to the
//! lapin representation used by the broker adapter.

use serde::Deserialize;

/// Represents the types of exchanges available on the broker.
///
/// - Direct: routes messages to queues on an exact routing-key match
/// - Fanout: broadcasts messages to all bound queues
/// - Topic: routes messages by wildcard pattern matching
/// - Headers: routes on message header values instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}
