// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges are the routing entry point of the broker: a publish names an
//! exchange and the exchange type decides which bound queues receive the
//! message. This module defines the supported exchange types and the
//! definition record kept by the topology store.

use crate::errors::AmqpError;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use std::{fmt, str::FromStr};

/// Name of the pre-declared default exchange.
pub const DEFAULT_EXCHANGE: &str = "";

/// Represents the types of exchanges supported by the engine.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

impl TryFrom<&lapin::ExchangeKind> for ExchangeKind {
    type Error = AmqpError;

    /// Custom exchange types (plugins) have no routing implementation here.
    fn try_from(kind: &lapin::ExchangeKind) -> Result<Self, AmqpError> {
        match kind {
            lapin::ExchangeKind::Direct => Ok(ExchangeKind::Direct),
            lapin::ExchangeKind::Fanout => Ok(ExchangeKind::Fanout),
            lapin::ExchangeKind::Headers => Ok(ExchangeKind::Headers),
            lapin::ExchangeKind::Topic => Ok(ExchangeKind::Topic),
            lapin::ExchangeKind::Custom(name) => Err(AmqpError::TopologyConflict(format!(
                "unsupported exchange type `{name}`"
            ))),
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(AmqpError::TopologyConflict(format!(
                "unsupported exchange type `{other}`"
            ))),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Fanout => write!(f, "fanout"),
            Self::Topic => write!(f, "topic"),
            Self::Headers => write!(f, "headers"),
        }
    }
}

/// Definition of an exchange as held by the topology store.
///
/// Built with the same chaining style as the client-side definitions so a
/// caller can describe an exchange once and declare it on any engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) internal: bool,
    pub(crate) params: FieldTable,
}

impl ExchangeDefinition {
    /// Creates a new non-durable direct exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: false,
            auto_delete: false,
            internal: false,
            params: FieldTable::default(),
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    pub fn headers(self) -> Self {
        self.kind(ExchangeKind::Headers)
    }

    /// Marks the exchange durable. The flag is recorded and compared on
    /// redeclaration; nothing is persisted.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Internal exchanges refuse direct publishing.
    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    /// Sets the exchange arguments.
    pub fn params(mut self, params: FieldTable) -> Self {
        self.params = params;
        self
    }

    /// Adds a single argument to the exchange.
    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    /// A redeclaration is compatible when type and durability agree.
    pub(crate) fn conflicts_with(&self, other: &ExchangeDefinition) -> Option<String> {
        if self.kind != other.kind {
            return Some(format!(
                "exchange `{}` already declared as {} (requested {})",
                self.name, self.kind, other.kind
            ));
        }

        if self.durable != other.durable {
            return Some(format!(
                "exchange `{}` already declared with durable={} (requested {})",
                self.name, self.durable, other.durable
            ));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays_kinds() {
        for kind in ["direct", "fanout", "topic", "headers"] {
            let parsed: ExchangeKind = kind.parse().unwrap();
            assert_eq!(parsed.to_string(), kind);
        }

        assert!(matches!(
            "x-delayed-message".parse::<ExchangeKind>(),
            Err(AmqpError::TopologyConflict(_))
        ));
    }

    #[test]
    fn converts_lapin_kinds() {
        let kind: lapin::ExchangeKind = ExchangeKind::Topic.into();
        assert_eq!(kind, lapin::ExchangeKind::Topic);

        let custom = lapin::ExchangeKind::Custom("x-consistent-hash".to_owned());
        assert!(ExchangeKind::try_from(&custom).is_err());
    }

    #[test]
    fn redeclaration_conflicts_on_kind_or_durability() {
        let existing = ExchangeDefinition::new("orders").topic().durable(true);

        assert!(existing
            .conflicts_with(&ExchangeDefinition::new("orders").topic().durable(true))
            .is_none());
        assert!(existing
            .conflicts_with(&ExchangeDefinition::new("orders").fanout().durable(true))
            .is_some());
        assert!(existing
            .conflicts_with(&ExchangeDefinition::new("orders").topic())
            .is_some());
    }
}
