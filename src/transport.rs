// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Boundary
//!
//! The narrow set of broker primitives a [`BrokerSession`](crate::session::BrokerSession)
//! is built on. One transport value owns one connection and one channel.
//! [`LapinTransport`](crate::channel::LapinTransport) speaks AMQP through lapin,
//! [`InMemoryTransport`](crate::memory::InMemoryTransport) keeps everything in process.

use crate::{
    envelope::{Envelope, Headers},
    errors::BrokerError,
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

/// A message pulled from a queue, before the session wraps it into an [`Envelope`].
#[derive(Debug, Clone, PartialEq)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub payload: Vec<u8>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub headers: Headers,
}

/// Broker primitives over one connection/channel pair.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declares an exchange. Re-declaring an identical exchange is a no-op.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BrokerError>;

    /// Declares a queue. Re-declaring an identical queue is a no-op.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), BrokerError>;

    /// Binds `queue` to `exchange` under `routing_key`.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publishes the envelope to `exchange` under `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), BrokerError>;

    /// Pulls at most one message without auto-acknowledging it. Never waits
    /// for a message to arrive.
    async fn pull(&self, queue: &str) -> Result<Option<RawDelivery>, BrokerError>;

    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Closes the channel, then the connection.
    async fn close(&self) -> Result<(), BrokerError>;
}
