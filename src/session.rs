// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Session
//!
//! A [`BrokerSession`] owns one transport (one connection and one channel) and
//! exposes the four primitives the rest of the system depends on: `bind`,
//! `produce`, `consume` and `ack`.
//!
//! Deliveries are never auto-acknowledged. Every envelope returned by
//! [`BrokerSession::consume`] stays [`DeliveryState::Delivered`] until it is
//! settled exactly once with [`BrokerSession::ack`] or [`BrokerSession::nack`].
//! Closing or dropping the session with unsettled deliveries hands them back to
//! the broker for redelivery.
//!
//! Only pending delivery tags are tracked. Tags are handed out in increasing
//! order per channel, so a tag of this session that is no longer pending has
//! been settled.

use crate::{
    channel::LapinTransport,
    configs::Configs,
    envelope::{standard_headers, DeliveryHandle, Envelope},
    errors::BrokerError,
    otel,
    topology::TopologyBinding,
    transport::{RawDelivery, Transport},
};
use opentelemetry::Context;
use serde::Serialize;
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

/// Settlement state of a delivery made to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Returned by `consume`, not settled yet
    Delivered,
    /// Settled with `ack` or `nack`
    Settled,
}

pub struct BrokerSession {
    id: Uuid,
    producer: String,
    transport: Box<dyn Transport>,
    binding: Option<TopologyBinding>,
    /// Tags returned by `consume` and not settled yet
    pending: Mutex<HashSet<u64>>,
}

impl BrokerSession {
    /// Connects to RabbitMQ and opens the session's channel.
    ///
    /// The application name in `cfg` becomes the `x-producer` header of every
    /// envelope this session produces.
    pub async fn connect(cfg: &Configs) -> Result<BrokerSession, BrokerError> {
        let transport = LapinTransport::connect(cfg).await?;
        Ok(BrokerSession::new(transport, &cfg.app.name))
    }

    /// Builds a session over an already connected transport.
    pub fn new<T>(transport: T, producer: &str) -> BrokerSession
    where
        T: Transport + 'static,
    {
        BrokerSession {
            id: Uuid::new_v4(),
            producer: producer.to_owned(),
            transport: Box::new(transport),
            binding: None,
            pending: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    /// The current binding, if `bind` succeeded at least once.
    pub fn binding(&self) -> Option<&TopologyBinding> {
        self.binding.as_ref()
    }

    /// Declares a durable direct exchange and a durable queue, binds them under
    /// `routing_key` and makes that triple the session's routing association.
    ///
    /// Binding the same triple again is harmless. Binding a different triple
    /// replaces the association; the previous broker-side binding is kept.
    ///
    /// # Parameters
    /// * `exchange` - Name of the direct exchange to declare
    /// * `queue` - Name of the queue to declare and bind
    /// * `routing_key` - Key the queue is bound under, also used by `produce`
    ///
    /// # Returns
    /// `Ok(())` once the topology exists, [`BrokerError::InvalidBinding`] for an
    /// empty name, or a topology error when the broker refuses a declaration.
    /// On error the session keeps its previous binding.
    pub async fn bind(
        &mut self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let binding = TopologyBinding::new(exchange, queue, routing_key)?;
        binding.install(self.transport.as_ref()).await?;

        debug!(
            session = %self.id,
            exchange, queue, routing_key,
            "session bound"
        );
        self.binding = Some(binding);
        Ok(())
    }

    /// Publishes `payload` to the bound exchange under the bound routing key and
    /// returns the envelope that was sent.
    ///
    /// # Parameters
    /// * `payload` - Message body, published unchanged
    ///
    /// # Returns
    /// The outbound envelope with its id, timestamp and standard headers, or
    /// [`BrokerError::PublishingError`] when the session is not bound or the
    /// transport refuses the write. Nothing is retried here.
    pub async fn produce(&self, payload: impl Into<Vec<u8>>) -> Result<Envelope, BrokerError> {
        let Some(binding) = &self.binding else {
            error!(session = %self.id, "produce called before bind");
            return Err(BrokerError::PublishingError(
                "session has no topology binding".to_owned(),
            ));
        };

        let mut headers = standard_headers(&self.producer);
        otel::inject(&Context::current(), &mut headers);

        let envelope = Envelope::outbound(payload.into(), binding.routing_key(), headers);

        self.transport
            .publish(binding.exchange(), binding.routing_key(), &envelope)
            .await
            .map_err(|err| match err {
                BrokerError::PublishingError(_) => err,
                other => BrokerError::PublishingError(other.to_string()),
            })?;

        debug!(
            message_id = envelope.id(),
            exchange = binding.exchange(),
            routing_key = binding.routing_key(),
            "message published"
        );

        Ok(envelope)
    }

    /// Serializes `value` as JSON and produces it.
    pub async fn produce_json<T: Serialize + ?Sized>(
        &self,
        value: &T,
    ) -> Result<Envelope, BrokerError> {
        let payload = serde_json::to_vec(value)
            .map_err(|err| BrokerError::PublishingError(err.to_string()))?;
        self.produce(payload).await
    }

    /// Pulls at most one message from the bound queue.
    ///
    /// # Returns
    /// * `Ok(Some(envelope))` - A delivery, left unacknowledged until `ack` or `nack`
    /// * `Ok(None)` - The queue was empty; this never waits for a message
    /// * `Err(BrokerError::ConsumingError)` - The session is not bound or the pull failed
    pub async fn consume(&self) -> Result<Option<Envelope>, BrokerError> {
        let Some(binding) = &self.binding else {
            error!(session = %self.id, "consume called before bind");
            return Err(BrokerError::ConsumingError(
                "session has no topology binding".to_owned(),
            ));
        };

        let Some(raw) = self
            .transport
            .pull(binding.queue())
            .await
            .map_err(|err| match err {
                BrokerError::ConsumingError(_) => err,
                other => BrokerError::ConsumingError(other.to_string()),
            })?
        else {
            return Ok(None);
        };

        self.pending.lock().await.insert(raw.delivery_tag);

        let envelope = self.wrap(raw);
        debug!(
            message_id = envelope.id(),
            routing_key = envelope.routing_key(),
            redelivered = envelope.is_redelivered(),
            "message received"
        );

        Ok(Some(envelope))
    }

    /// Acknowledges a delivery made by this session.
    ///
    /// # Parameters
    /// * `envelope` - An envelope returned by this session's `consume`
    ///
    /// # Returns
    /// `Ok(())` once the broker has the acknowledgement. Must be called exactly
    /// once per delivered envelope: a second call, or a call for an envelope
    /// this session never delivered, is an [`BrokerError::AckError`]. When the
    /// transport fails the delivery stays pending.
    pub async fn ack(&self, envelope: &Envelope) -> Result<(), BrokerError> {
        let tag = self.own_delivery(envelope)?;
        let mut pending = self.pending.lock().await;
        Self::ensure_unsettled(&pending, tag)?;

        self.transport.acknowledge(tag).await.map_err(|err| match err {
            BrokerError::AckError(_) => err,
            other => BrokerError::AckError(other.to_string()),
        })?;
        pending.remove(&tag);

        debug!(message_id = envelope.id(), delivery_tag = tag, "message acked");
        Ok(())
    }

    /// Negatively acknowledges a delivery made by this session. With `requeue`
    /// the broker will deliver the message again, otherwise it is dropped or
    /// dead-lettered per the queue's policy.
    ///
    /// # Parameters
    /// * `envelope` - An envelope returned by this session's `consume`
    /// * `requeue` - Whether the broker should deliver the message again
    ///
    /// # Returns
    /// The same exactly-once rules as [`BrokerSession::ack`] apply; a transport
    /// failure is a [`BrokerError::NackError`].
    pub async fn nack(&self, envelope: &Envelope, requeue: bool) -> Result<(), BrokerError> {
        let tag = self.own_delivery(envelope)?;
        let mut pending = self.pending.lock().await;
        Self::ensure_unsettled(&pending, tag)?;

        self.transport.reject(tag, requeue).await.map_err(|err| match err {
            BrokerError::NackError(_) => err,
            other => BrokerError::NackError(other.to_string()),
        })?;
        pending.remove(&tag);

        debug!(message_id = envelope.id(), delivery_tag = tag, requeue, "message nacked");
        Ok(())
    }

    /// Settlement state of `envelope`, or `None` if this session did not deliver it.
    pub async fn delivery_state(&self, envelope: &Envelope) -> Option<DeliveryState> {
        let handle = envelope.delivery()?;
        if handle.session != self.id {
            return None;
        }
        if self.pending.lock().await.contains(&handle.tag) {
            Some(DeliveryState::Delivered)
        } else {
            Some(DeliveryState::Settled)
        }
    }

    /// Number of deliveries still waiting for `ack` or `nack`.
    pub async fn unsettled(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Closes the channel, then the connection.
    ///
    /// Deliveries still unsettled at this point are requeued by the broker.
    pub async fn close(self) -> Result<(), BrokerError> {
        let unsettled = self.unsettled().await;
        if unsettled > 0 {
            debug!(session = %self.id, unsettled, "closing with unsettled deliveries");
        }
        self.transport.close().await
    }

    fn wrap(&self, raw: RawDelivery) -> Envelope {
        Envelope::inbound(
            raw.payload,
            raw.message_id.unwrap_or_default(),
            raw.timestamp.unwrap_or_default(),
            raw.headers,
            raw.routing_key,
            DeliveryHandle {
                session: self.id,
                tag: raw.delivery_tag,
            },
            raw.redelivered,
        )
    }

    fn own_delivery(&self, envelope: &Envelope) -> Result<u64, BrokerError> {
        let Some(handle) = envelope.delivery() else {
            return Err(BrokerError::AckError(format!(
                "message `{}` was never delivered",
                envelope.id()
            )));
        };

        if handle.session != self.id {
            return Err(BrokerError::AckError(format!(
                "message `{}` was delivered by another session",
                envelope.id()
            )));
        }

        Ok(handle.tag)
    }

    fn ensure_unsettled(pending: &HashSet<u64>, tag: u64) -> Result<(), BrokerError> {
        if pending.contains(&tag) {
            return Ok(());
        }
        Err(BrokerError::AckError(format!(
            "delivery {tag} already settled"
        )))
    }
}
