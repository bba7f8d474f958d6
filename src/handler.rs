// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A [`Handler`] is the business logic behind one routing key. It is handed the
//! session that delivered the envelope and the envelope itself, and it owns the
//! settlement: its last act must be an `ack` (or a `nack`) of that envelope.
//! The dispatcher never settles on a handler's behalf.

use crate::{
    envelope::Envelope,
    errors::BrokerError,
    session::BrokerSession,
};
use async_trait::async_trait;
use opentelemetry::Context;

/// Everything a handler gets for one delivery.
pub struct HandlerContext<'a> {
    session: &'a BrokerSession,
    envelope: &'a Envelope,
    trace: Context,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(session: &'a BrokerSession, envelope: &'a Envelope, trace: Context) -> Self {
        HandlerContext {
            session,
            envelope,
            trace,
        }
    }

    pub fn session(&self) -> &BrokerSession {
        self.session
    }

    pub fn envelope(&self) -> &Envelope {
        self.envelope
    }

    /// Trace context propagated by the producer.
    pub fn trace(&self) -> &Context {
        &self.trace
    }

    /// Acknowledges the envelope on the session that delivered it.
    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.session.ack(self.envelope).await
    }

    /// Negatively acknowledges the envelope on the session that delivered it.
    pub async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.session.nack(self.envelope, requeue).await
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// Processes one envelope and settles it.
    ///
    /// Returning an error before settling leaves the envelope unacknowledged,
    /// the broker redelivers it once the session goes away.
    async fn handle(&self, ctx: &HandlerContext<'_>) -> Result<(), BrokerError>;
}
