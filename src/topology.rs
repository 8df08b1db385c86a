// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Store
//!
//! Holds the exchanges, queues and bindings of one broker instance and
//! enforces their declaration rules. Topology mutations serialize on a
//! single store-wide lock that is only held for the mutation itself;
//! message dispatch happens afterwards under the per-queue locks.
//!
//! Lock order is always topology, then queue, then channel registries.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind, DEFAULT_EXCHANGE},
    message::Message,
    queue::{Queue, QueueBinding, QueueDefinition, QueueInfo},
    router::{self, Binding, HeadersMatch},
};
use lapin::types::FieldTable;
use parking_lot::RwLock;
use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, warn};

/// Prefix reserved for broker-defined exchanges.
pub const RESERVED_EXCHANGE_PREFIX: &str = "amq.";

#[derive(Default)]
struct TopologyState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, Arc<Queue>>,
    bindings: Vec<Binding>,
}

/// The exchanges, queues and bindings of one broker.
pub struct Topology {
    state: RwLock<TopologyState>,
    next_channel_key: AtomicU64,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    /// Creates a store holding only the broker-defined exchanges.
    pub fn new() -> Topology {
        let topology = Topology {
            state: RwLock::new(TopologyState::default()),
            next_channel_key: AtomicU64::new(1),
        };

        topology.install_defaults();
        topology
    }

    fn install_defaults(&self) {
        let mut state = self.state.write();

        let defaults = [
            ExchangeDefinition::new(DEFAULT_EXCHANGE).direct(),
            ExchangeDefinition::new("amq.direct").direct(),
            ExchangeDefinition::new("amq.fanout").fanout(),
            ExchangeDefinition::new("amq.topic").topic(),
            ExchangeDefinition::new("amq.headers").headers(),
        ];

        for def in defaults {
            state.exchanges.insert(def.name.clone(), def.durable(true));
        }
    }

    pub(crate) fn next_channel_key(&self) -> u64 {
        self.next_channel_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Declares an exchange. Redeclaring with the same type and durability
    /// is a no-op; anything else is a `TopologyConflict`.
    pub fn declare_exchange(&self, def: ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.state.write();

        if let Some(existing) = state.exchanges.get(&def.name) {
            return match existing.conflicts_with(&def) {
                Some(conflict) if is_reserved(&def.name) => Err(AmqpError::AccessRefused(conflict)),
                Some(conflict) => {
                    warn!(exchange = def.name, "{}", conflict);
                    Err(AmqpError::TopologyConflict(conflict))
                }
                None => Ok(()),
            };
        }

        if is_reserved(&def.name) {
            return Err(AmqpError::AccessRefused(format!(
                "exchange name `{}` uses the reserved prefix {RESERVED_EXCHANGE_PREFIX}",
                def.name
            )));
        }

        debug!("exchange: {} was created", def.name);
        state.exchanges.insert(def.name.clone(), def);

        Ok(())
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        self.state.read().exchanges.get(name).cloned()
    }

    pub fn exchange_names(&self) -> BTreeSet<String> {
        self.state.read().exchanges.keys().cloned().collect()
    }

    /// Deletes an exchange together with all of its bindings.
    pub fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<(), AmqpError> {
        let mut state = self.state.write();

        if is_reserved(name) {
            return Err(AmqpError::AccessRefused(format!(
                "exchange `{name}` cannot be deleted"
            )));
        }

        if !state.exchanges.contains_key(name) {
            return Err(AmqpError::NotFound(format!("exchange `{name}`")));
        }

        if if_unused && state.bindings.iter().any(|b| b.binding.exchange_name == name) {
            return Err(AmqpError::TopologyConflict(format!(
                "exchange `{name}` is in use"
            )));
        }

        state.exchanges.remove(name);
        state.bindings.retain(|b| b.binding.exchange_name != name);
        debug!("exchange: {} was deleted", name);

        Ok(())
    }

    /// Declares a queue on behalf of connection `owner`.
    ///
    /// Redeclaring with the same durability returns the current counters.
    /// Exclusive queues belong to the declaring connection.
    pub fn declare_queue(&self, def: QueueDefinition, owner: u64) -> Result<QueueInfo, AmqpError> {
        let mut state = self.state.write();

        if let Some(existing) = state.queues.get(&def.name) {
            check_owner(existing, owner)?;

            if let Some(conflict) = existing.definition.conflicts_with(&def) {
                warn!(queue = def.name, "{}", conflict);
                return Err(AmqpError::TopologyConflict(conflict));
            }

            return Ok(existing.info());
        }

        let queue_owner = def.exclusive.then_some(owner);
        let queue = Arc::new(Queue::new(def, queue_owner));
        let info = queue.info();

        debug!("queue: {} was created", queue.name());
        state.queues.insert(queue.name().to_owned(), queue);

        Ok(info)
    }

    pub(crate) fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.state.read().queues.get(name).cloned()
    }

    /// Looks a queue up for use by connection `owner`.
    pub(crate) fn accessible_queue(&self, name: &str, owner: u64) -> Result<Arc<Queue>, AmqpError> {
        let queue = self
            .queue(name)
            .ok_or_else(|| AmqpError::NotFound(format!("queue `{name}`")))?;

        check_owner(&queue, owner)?;

        Ok(queue)
    }

    /// Current counters of a queue (a passive declare).
    pub fn queue_info(&self, name: &str) -> Result<QueueInfo, AmqpError> {
        self.queue(name)
            .map(|q| q.info())
            .ok_or_else(|| AmqpError::NotFound(format!("queue `{name}`")))
    }

    pub fn queue_names(&self) -> BTreeSet<String> {
        self.state.read().queues.keys().cloned().collect()
    }

    /// Deletes a queue and its bindings. Ready and in-flight messages are
    /// discarded and cannot be recovered, and the queue's consumers are
    /// cancelled. Returns the number of ready messages discarded.
    pub fn delete_queue(&self, name: &str, if_unused: bool, if_empty: bool) -> Result<u32, AmqpError> {
        let mut state = self.state.write();

        let queue = state
            .queues
            .get(name)
            .cloned()
            .ok_or_else(|| AmqpError::NotFound(format!("queue `{name}`")))?;

        let mut queue_state = queue.state.lock();

        if if_unused && !queue_state.consumers.is_empty() {
            return Err(AmqpError::TopologyConflict(format!("queue `{name}` is in use")));
        }

        if if_empty && !queue_state.ready.is_empty() {
            return Err(AmqpError::TopologyConflict(format!("queue `{name}` is not empty")));
        }

        state.queues.remove(name);
        state.bindings.retain(|b| b.binding.queue_name != name);
        let discarded = queue_state.discard();

        debug!("queue: {} was deleted, {} messages discarded", name, discarded);

        Ok(discarded)
    }

    /// Deletes an auto-delete queue once nothing consumes from it.
    pub(crate) fn delete_if_unused(&self, name: &str) {
        match self.delete_queue(name, true, false) {
            Ok(_) => debug!("auto-delete queue: {} removed", name),
            Err(err) => debug!(error = err.to_string(), "auto-delete queue kept"),
        }
    }

    /// Deletes the exclusive queues of a closed connection.
    pub(crate) fn delete_owned_queues(&self, owner: u64) {
        let owned: Vec<String> = self
            .state
            .read()
            .queues
            .values()
            .filter(|q| q.owner == Some(owner))
            .map(|q| q.name().to_owned())
            .collect();

        for name in owned {
            if let Err(err) = self.delete_queue(&name, false, false) {
                debug!(error = err.to_string(), "exclusive queue already gone");
            }
        }
    }

    /// Drops every ready message of a queue. Returns how many were dropped.
    pub fn purge_queue(&self, name: &str) -> Result<u32, AmqpError> {
        let queue = self
            .queue(name)
            .ok_or_else(|| AmqpError::NotFound(format!("queue `{name}`")))?;

        let mut state = queue.state.lock();
        let purged = u32::try_from(state.ready.len()).unwrap_or(u32::MAX);
        state.ready.clear();

        debug!("queue: {} purged {} messages", name, purged);

        Ok(purged)
    }

    /// Binds a queue to an exchange. Binding an identical tuple twice is a
    /// no-op.
    pub fn bind(&self, binding: QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state.write();
        let exchange = lookup_for_binding(&state, &binding)?;

        let headers_match = match exchange.kind {
            ExchangeKind::Headers => HeadersMatch::from_arguments(&binding.arguments)?,
            _ => HeadersMatch::default(),
        };

        let binding = Binding {
            binding,
            headers_match,
        };

        if state.bindings.contains(&binding) {
            return Ok(());
        }

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.binding.queue_name, binding.binding.exchange_name, binding.binding.routing_key
        );
        state.bindings.push(binding);

        Ok(())
    }

    /// Removes a binding. Unbinding a tuple that is not bound is a no-op.
    pub fn unbind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state.write();
        lookup_for_binding(&state, binding)?;

        state.bindings.retain(|b| &b.binding != binding);

        Ok(())
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.state
            .read()
            .bindings
            .iter()
            .map(|b| b.binding.clone())
            .collect()
    }

    /// Computes the queues a message reaches. Fails with `NotFound` when the
    /// exchange does not exist.
    pub fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: Option<&FieldTable>,
    ) -> Result<BTreeSet<String>, AmqpError> {
        let state = self.state.read();
        let def = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| AmqpError::NotFound(format!("exchange `{exchange}`")))?;

        Ok(router::route(
            def,
            state.bindings.iter(),
            |name| state.queues.contains_key(name),
            routing_key,
            headers,
        ))
    }

    /// Routes and enqueues a message, returning the number of queues reached.
    ///
    /// All matched queues are locked (in name order) before any of them
    /// receives the message, so a publish lands in all of them or in none.
    pub(crate) fn publish(&self, message: Message, mandatory: bool) -> Result<usize, AmqpError> {
        let queues: Vec<Arc<Queue>> = {
            let state = self.state.read();
            let def = state.exchanges.get(&message.exchange).ok_or_else(|| {
                AmqpError::NotFound(format!("exchange `{}`", message.exchange))
            })?;

            if def.internal {
                return Err(AmqpError::AccessRefused(format!(
                    "exchange `{}` is internal",
                    def.name
                )));
            }

            router::route(
                def,
                state.bindings.iter(),
                |name| state.queues.contains_key(name),
                &message.routing_key,
                message.headers(),
            )
            .iter()
            .filter_map(|name| state.queues.get(name).cloned())
            .collect()
        };

        if queues.is_empty() {
            if mandatory {
                return Err(AmqpError::Unroutable {
                    exchange: message.exchange,
                    routing_key: message.routing_key,
                });
            }

            debug!(
                "dropping unroutable message - exchange: {} key: {}",
                message.exchange, message.routing_key
            );
            return Ok(0);
        }

        let mut guards: Vec<_> = queues.iter().map(|q| (q, q.state.lock())).collect();
        guards.retain(|(_, state)| !state.deleted);

        for (queue, state) in guards.iter_mut() {
            state.enqueue(queue.definition.max_length, message.clone());
        }

        for (queue, state) in guards.iter_mut() {
            state.dispatch(queue.name());
        }

        Ok(guards.len())
    }

    /// Requeues every delivery that stayed unacknowledged for `timeout`.
    pub fn requeue_expired(&self, timeout: Duration) -> usize {
        let queues: Vec<Arc<Queue>> = self.state.read().queues.values().cloned().collect();

        queues
            .iter()
            .map(|q| q.state.lock().requeue_expired(q.name(), timeout))
            .sum()
    }

    /// Removes every queue, binding and user-declared exchange.
    pub fn clear(&self) {
        let names = self.queue_names();
        for name in names {
            if let Err(err) = self.delete_queue(&name, false, false) {
                debug!(error = err.to_string(), "queue already gone");
            }
        }

        let mut state = self.state.write();
        state.bindings.clear();
        state.exchanges.clear();
        drop(state);

        self.install_defaults();
    }
}

fn is_reserved(exchange: &str) -> bool {
    exchange == DEFAULT_EXCHANGE || exchange.starts_with(RESERVED_EXCHANGE_PREFIX)
}

fn check_owner(queue: &Queue, owner: u64) -> Result<(), AmqpError> {
    match queue.owner {
        Some(existing) if existing != owner => Err(AmqpError::AccessRefused(format!(
            "queue `{}` is exclusive to another connection",
            queue.name()
        ))),
        _ => Ok(()),
    }
}

fn lookup_for_binding<'s>(
    state: &'s TopologyState,
    binding: &QueueBinding,
) -> Result<&'s ExchangeDefinition, AmqpError> {
    if binding.exchange_name == DEFAULT_EXCHANGE {
        return Err(AmqpError::AccessRefused(
            "the default exchange cannot be bound".to_owned(),
        ));
    }

    let exchange = state
        .exchanges
        .get(&binding.exchange_name)
        .ok_or_else(|| AmqpError::NotFound(format!("exchange `{}`", binding.exchange_name)))?;

    if !state.queues.contains_key(&binding.queue_name) {
        return Err(AmqpError::NotFound(format!("queue `{}`", binding.queue_name)));
    }

    Ok(exchange)
}
