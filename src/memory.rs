// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A process-local stand-in for RabbitMQ, for tests and local development.
//!
//! [`InMemoryBroker`] holds the shared state (exchanges, queues, bindings);
//! every [`InMemoryTransport`] obtained from it plays the role of one
//! connection/channel pair with its own delivery tag sequence. Semantics follow
//! the broker where sessions can observe them:
//! - re-declaring with identical flags is a no-op, with different flags it fails
//! - direct exchanges route on exact routing key match, `""` is the default exchange
//! - unacked deliveries are requeued, flagged as redelivered, when the
//!   transport is closed or dropped

use crate::{
    envelope::{Envelope, Headers},
    errors::BrokerError,
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
    transport::{RawDelivery, Transport},
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    payload: Vec<u8>,
    message_id: String,
    timestamp: u64,
    headers: Headers,
    redelivered: bool,
}

#[derive(Debug)]
struct QueueState {
    def: QueueDefinition,
    ready: VecDeque<StoredMessage>,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    /// (exchange, routing key, queue)
    bindings: HashSet<(String, String, String)>,
}

/// Shared state of an in-process broker. Cloning yields another handle to the same broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    published: Arc<AtomicUsize>,
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        InMemoryBroker::default()
    }

    /// Opens a new connection/channel pair on this broker.
    pub fn transport(&self) -> InMemoryTransport {
        InMemoryTransport {
            broker: self.clone(),
            next_tag: AtomicU64::new(1),
            unacked: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of messages waiting in `queue`, unacked deliveries excluded.
    ///
    /// The inspection methods fail with [`BrokerError::InternalError`] once a
    /// panic poisoned the broker state, rather than reporting it as empty.
    pub fn ready_count(&self, queue: &str) -> Result<usize, BrokerError> {
        Ok(self.lock()?.queues.get(queue).map_or(0, |q| q.ready.len()))
    }

    /// Total number of messages accepted by an exchange.
    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    pub fn exchange_count(&self) -> Result<usize, BrokerError> {
        Ok(self.lock()?.exchanges.len())
    }

    pub fn queue_count(&self) -> Result<usize, BrokerError> {
        Ok(self.lock()?.queues.len())
    }

    pub fn binding_count(&self) -> Result<usize, BrokerError> {
        Ok(self.lock()?.bindings.len())
    }

    pub fn has_binding(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Result<bool, BrokerError> {
        Ok(self.lock()?.bindings.contains(&(
            exchange.to_owned(),
            routing_key.to_owned(),
            queue.to_owned(),
        )))
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::InternalError("in-memory broker state poisoned".to_owned()))
    }

    fn requeue(&self, queue: &str, mut msg: StoredMessage) -> Result<(), BrokerError> {
        msg.redelivered = true;
        if let Some(q) = self.lock()?.queues.get_mut(queue) {
            q.ready.push_front(msg);
        }
        Ok(())
    }
}

/// One connection/channel pair on an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryTransport {
    broker: InMemoryBroker,
    next_tag: AtomicU64,
    unacked: Mutex<HashMap<u64, (String, StoredMessage)>>,
    closed: AtomicBool,
}

impl InMemoryTransport {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelError("channel is closed".to_owned()));
        }
        Ok(())
    }

    fn take_unacked(
        &self,
        delivery_tag: u64,
    ) -> Result<Option<(String, StoredMessage)>, BrokerError> {
        Ok(self
            .unacked
            .lock()
            .map_err(|_| BrokerError::InternalError("in-memory channel state poisoned".to_owned()))?
            .remove(&delivery_tag))
    }

    fn release(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut pending: Vec<_> = self
            .unacked
            .lock()
            .map_err(|_| BrokerError::InternalError("in-memory channel state poisoned".to_owned()))?
            .drain()
            .collect();

        // Requeue newest first so the oldest delivery ends up at the head.
        pending.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, (queue, msg)) in pending {
            debug!(queue = %queue, message_id = %msg.message_id, "requeuing unacked message");
            self.broker.requeue(&queue, msg)?;
        }

        Ok(())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock()?;

        match state.exchanges.get(&def.name) {
            Some(existing) if existing != def => {
                Err(BrokerError::DeclareExchangeError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock()?;

        match state.queues.get(&def.name) {
            Some(existing) if existing.def != *def => {
                Err(BrokerError::DeclareQueueError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    def.name.clone(),
                    QueueState {
                        def: def.clone(),
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock()?;

        if !state.exchanges.contains_key(exchange) || !state.queues.contains_key(queue) {
            return Err(BrokerError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        state.bindings.insert((
            exchange.to_owned(),
            routing_key.to_owned(),
            queue.to_owned(),
        ));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock()?;

        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_owned()]
        } else if state.exchanges.contains_key(exchange) {
            state
                .bindings
                .iter()
                .filter(|(ex, key, _)| ex == exchange && key == routing_key)
                .map(|(_, _, queue)| queue.clone())
                .collect()
        } else {
            return Err(BrokerError::PublishingError(format!(
                "no exchange `{exchange}`"
            )));
        };

        let msg = StoredMessage {
            routing_key: routing_key.to_owned(),
            payload: envelope.payload().to_vec(),
            message_id: envelope.id().to_owned(),
            timestamp: envelope.timestamp(),
            headers: envelope.headers().clone(),
            redelivered: false,
        };

        // Unroutable messages are dropped, as with a non-mandatory publish.
        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(msg.clone());
            }
        }

        self.broker.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn pull(&self, queue: &str) -> Result<Option<RawDelivery>, BrokerError> {
        self.ensure_open()?;

        let msg = {
            let mut state = self.broker.lock()?;
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(BrokerError::ConsumingError(format!("no queue `{queue}`")));
            };
            q.ready.pop_front()
        };

        let Some(msg) = msg else {
            return Ok(None);
        };

        let delivery_tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        self.unacked
            .lock()
            .map_err(|_| BrokerError::InternalError("in-memory channel state poisoned".to_owned()))?
            .insert(delivery_tag, (queue.to_owned(), msg.clone()));

        Ok(Some(RawDelivery {
            delivery_tag,
            routing_key: msg.routing_key,
            redelivered: msg.redelivered,
            payload: msg.payload,
            message_id: Some(msg.message_id),
            timestamp: Some(msg.timestamp),
            headers: msg.headers,
        }))
    }

    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;

        match self.take_unacked(delivery_tag)? {
            Some(_) => Ok(()),
            None => Err(BrokerError::AckError(format!(
                "unknown delivery tag {delivery_tag}"
            ))),
        }
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let Some((queue, msg)) = self.take_unacked(delivery_tag)? else {
            return Err(BrokerError::NackError(format!(
                "unknown delivery tag {delivery_tag}"
            )));
        };

        if requeue {
            self.broker.requeue(&queue, msg)?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.release()
    }
}

impl Drop for InMemoryTransport {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
