// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Router
//!
//! Computes the destination queues of a published message from the
//! exchange type, the routing key and the message headers.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind, DEFAULT_EXCHANGE},
    queue::QueueBinding,
};
use lapin::types::{AMQPValue, FieldTable};
use std::collections::BTreeSet;

/// Binding argument selecting the headers matching mode.
pub const AMQP_HEADERS_X_MATCH: &str = "x-match";

/// Matching mode of a headers exchange binding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HeadersMatch {
    /// Every listed header must match.
    #[default]
    All,
    /// At least one listed header must match.
    Any,
}

impl HeadersMatch {
    /// Reads `x-match` from binding arguments; absent means `all`.
    pub fn from_arguments(arguments: &FieldTable) -> Result<Self, AmqpError> {
        let Some(value) = arguments.inner().get(AMQP_HEADERS_X_MATCH) else {
            return Ok(HeadersMatch::All);
        };

        match as_text(value) {
            Some(b"all") => Ok(HeadersMatch::All),
            Some(b"any") => Ok(HeadersMatch::Any),
            _ => Err(AmqpError::TopologyConflict(format!(
                "invalid {AMQP_HEADERS_X_MATCH} binding argument {value:?}"
            ))),
        }
    }
}

/// A binding as stored by the topology store, with its headers matching
/// mode resolved at bind time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Binding {
    pub(crate) binding: QueueBinding,
    pub(crate) headers_match: HeadersMatch,
}

/// Returns the names of the queues a message published to `exchange` reaches.
///
/// `queue_exists` is only consulted by the default exchange, which reaches
/// every queue by its name.
pub(crate) fn route<'b>(
    exchange: &ExchangeDefinition,
    bindings: impl Iterator<Item = &'b Binding>,
    queue_exists: impl Fn(&str) -> bool,
    routing_key: &str,
    headers: Option<&FieldTable>,
) -> BTreeSet<String> {
    if exchange.name == DEFAULT_EXCHANGE {
        return if queue_exists(routing_key) {
            BTreeSet::from([routing_key.to_owned()])
        } else {
            BTreeSet::new()
        };
    }

    bindings
        .filter(|b| b.binding.exchange_name == exchange.name)
        .filter(|b| match exchange.kind {
            ExchangeKind::Fanout => true,
            ExchangeKind::Direct => b.binding.routing_key == routing_key,
            ExchangeKind::Topic => topic_matches(&b.binding.routing_key, routing_key),
            ExchangeKind::Headers => {
                headers_match(&b.binding.arguments, b.headers_match, headers)
            }
        })
        .map(|b| b.binding.queue_name.clone())
        .collect()
}

/// Anchored AMQP topic matching: `*` matches exactly one segment, `#` matches
/// zero or more segments anywhere in the pattern.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();

    segments_match(&pattern, &key)
}

fn segments_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // consecutive hashes behave like one
            if rest.first() == Some(&"#") {
                return segments_match(rest, key);
            }
            (0..=key.len()).any(|skip| segments_match(rest, &key[skip..]))
        }
        Some((&"*", rest)) => !key.is_empty() && segments_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && segments_match(rest, &key[1..]),
    }
}

/// Headers matching. Binding arguments starting with `x-` are not matched
/// against; a `Void` binding value only requires the header to be present.
pub fn headers_match(
    arguments: &FieldTable,
    mode: HeadersMatch,
    headers: Option<&FieldTable>,
) -> bool {
    let mut expected = arguments
        .inner()
        .iter()
        .filter(|(key, _)| !key.as_str().starts_with("x-"))
        .peekable();

    let matches_one = |(key, value): (&lapin::types::ShortString, &AMQPValue)| {
        let Some(actual) = headers.and_then(|h| h.inner().get(key)) else {
            return false;
        };
        matches!(value, AMQPValue::Void) || values_match(value, actual)
    };

    match mode {
        HeadersMatch::All => expected.all(matches_one),
        HeadersMatch::Any => expected.peek().is_some() && expected.any(matches_one),
    }
}

fn values_match(expected: &AMQPValue, actual: &AMQPValue) -> bool {
    match (as_text(expected), as_text(actual)) {
        (Some(expected), Some(actual)) => expected == actual,
        _ => expected == actual,
    }
}

fn as_text(value: &AMQPValue) -> Option<&[u8]> {
    match value {
        AMQPValue::ShortString(s) => Some(s.as_str().as_bytes()),
        AMQPValue::LongString(s) => Some(s.as_bytes()),
        _ => None,
    }
}
