// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! The immutable unit exchanged between producers and consumers: the payload
//! bytes plus the metadata written into the AMQP message properties.

use crate::errors::BrokerError;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Content type of every envelope produced by a session
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content encoding of every envelope produced by a session
pub const UTF8_CONTENT_ENCODING: &str = "UTF-8";
/// Header carrying the envelope protocol version
pub const AMQP_HEADERS_VERSION: &str = "x-version";
/// Header carrying the producing application's name
pub const AMQP_HEADERS_PRODUCER: &str = "x-producer";
/// Envelope protocol version written by this crate
pub const ENVELOPE_VERSION: &str = "1.0.0";

/// Primitive values allowed in envelope headers.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    String(String),
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

/// Envelope headers. Key order carries no meaning.
pub type Headers = BTreeMap<String, HeaderValue>;

/// Identifies one delivery made to one session.
///
/// The broker numbers deliveries per channel, so the tag alone is ambiguous
/// across sessions; the session id disambiguates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryHandle {
    pub(crate) session: Uuid,
    pub(crate) tag: u64,
}

impl DeliveryHandle {
    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }
}

/// A message as produced or as delivered.
///
/// Envelopes are never mutated once built. Whether a delivered envelope has
/// been acknowledged is tracked by the session that delivered it, see
/// [`BrokerSession::delivery_state`](crate::session::BrokerSession::delivery_state).
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    payload: Vec<u8>,
    id: String,
    timestamp: u64,
    headers: Headers,
    routing_key: String,
    delivery: Option<DeliveryHandle>,
    redelivered: bool,
}

impl Envelope {
    /// Builds a fresh outbound envelope with a new id and the current time.
    pub(crate) fn outbound(payload: Vec<u8>, routing_key: &str, headers: Headers) -> Envelope {
        Envelope {
            payload,
            id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
            headers,
            routing_key: routing_key.to_owned(),
            delivery: None,
            redelivered: false,
        }
    }

    pub(crate) fn inbound(
        payload: Vec<u8>,
        id: String,
        timestamp: u64,
        headers: Headers,
        routing_key: String,
        delivery: DeliveryHandle,
        redelivered: bool,
    ) -> Envelope {
        Envelope {
            payload,
            id,
            timestamp,
            headers,
            routing_key,
            delivery: Some(delivery),
            redelivered,
        }
    }

    /// Raw payload bytes. May be empty.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decodes the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, BrokerError> {
        serde_json::from_slice(&self.payload)
            .map_err(|err| BrokerError::ParsePayloadError(err.to_string()))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Producer send time, seconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }

    /// Value of the `x-version` header.
    pub fn version(&self) -> Option<&str> {
        self.header(AMQP_HEADERS_VERSION).and_then(HeaderValue::as_str)
    }

    /// Value of the `x-producer` header.
    pub fn producer(&self) -> Option<&str> {
        self.header(AMQP_HEADERS_PRODUCER).and_then(HeaderValue::as_str)
    }

    pub fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    pub fn content_encoding(&self) -> &'static str {
        UTF8_CONTENT_ENCODING
    }

    /// Routing identity: the bound key when produced, the delivery key when consumed.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Delivery handle, present only on envelopes returned by `consume`.
    pub fn delivery(&self) -> Option<DeliveryHandle> {
        self.delivery
    }

    /// Whether the broker has delivered this message before.
    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }
}

/// Headers every produced envelope carries.
pub(crate) fn standard_headers(producer: &str) -> Headers {
    let mut headers = Headers::new();
    headers.insert(AMQP_HEADERS_VERSION.to_owned(), ENVELOPE_VERSION.into());
    headers.insert(AMQP_HEADERS_PRODUCER.to_owned(), producer.into());
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_envelopes_get_unique_ids() {
        let a = Envelope::outbound(vec![], "k", standard_headers("svc"));
        let b = Envelope::outbound(vec![], "k", standard_headers("svc"));

        assert_ne!(a.id(), b.id());
        assert!(Uuid::parse_str(a.id()).is_ok());
        assert!(a.delivery().is_none());
    }

    #[test]
    fn standard_headers_carry_version_and_producer() {
        let envelope = Envelope::outbound(b"{}".to_vec(), "k", standard_headers("billing"));

        assert_eq!(envelope.version(), Some(ENVELOPE_VERSION));
        assert_eq!(envelope.producer(), Some("billing"));
        assert_eq!(envelope.content_type(), "application/json");
        assert_eq!(envelope.content_encoding(), "UTF-8");
    }

    #[test]
    fn empty_payload_is_still_an_envelope() {
        let envelope = Envelope::outbound(vec![], "k", Headers::new());

        assert!(envelope.payload().is_empty());
        assert!(matches!(
            envelope.json::<serde_json::Value>(),
            Err(BrokerError::ParsePayloadError(_))
        ));
    }

    #[test]
    fn decodes_json_payload() {
        let envelope = Envelope::outbound(br#"{"id":42}"#.to_vec(), "k", Headers::new());
        assert_eq!(envelope.json::<serde_json::Value>().unwrap(), json!({"id": 42}));
    }
}
