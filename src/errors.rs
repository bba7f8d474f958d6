// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Broker Session
//!
//! `BrokerError` covers every failure a session, its transport or the
//! dispatcher can surface. Each variant belongs to one [`ErrorKind`], which is
//! what callers usually branch on (e.g. retrying a publish, aborting startup on
//! a connection failure).

use thiserror::Error;

/// Coarse classification of a [`BrokerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connecting, authenticating or opening the channel failed.
    Connection,
    /// The binding was invalid or the broker rejected a declaration.
    Topology,
    /// Publishing an envelope failed.
    Publish,
    /// Pulling from the bound queue failed.
    Consume,
    /// Settling (ack/nack) a delivery failed or was a caller error.
    Ack,
    /// Routing an envelope to its handler failed.
    Dispatch,
    /// A handler failed before settling its delivery.
    Handler,
    /// Anything else.
    Internal,
}

/// Represents errors that can occur while talking to the broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Internal errors that don't fit into other categories
    #[error("internal error `{0}`")]
    InternalError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// One of the binding fields is empty
    #[error("invalid binding, `{0}` must not be empty")]
    InvalidBinding(&'static str),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error pulling a message
    #[error("failure to consume `{0}`")]
    ConsumingError(String),

    /// Error encoding or decoding a payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackError(String),

    /// No handler registered for the routing key
    #[error("no handler registered for routing key `{0}`")]
    UnregisteredRoutingKey(String),

    /// A handler is already registered for the routing key
    #[error("handler already registered for routing key `{0}`")]
    DuplicateHandler(String),

    /// The handler failed before settling its delivery
    #[error("handler failure `{0}`")]
    HandlerError(String),

    /// The handler returned without acking or nacking its delivery
    #[error("handler returned without settling message `{0}`")]
    UnsettledDelivery(String),

    /// Error closing the channel or the connection
    #[error("failure to close `{0}`")]
    CloseError(String),
}

impl BrokerError {
    /// Returns the category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::ConnectionError(_) | BrokerError::ChannelError(_) => ErrorKind::Connection,
            BrokerError::InvalidBinding(_)
            | BrokerError::DeclareExchangeError(_)
            | BrokerError::DeclareQueueError(_)
            | BrokerError::BindingExchangeToQueueError(_, _) => ErrorKind::Topology,
            BrokerError::PublishingError(_) => ErrorKind::Publish,
            BrokerError::ConsumingError(_) => ErrorKind::Consume,
            BrokerError::AckError(_) | BrokerError::NackError(_) => ErrorKind::Ack,
            BrokerError::UnregisteredRoutingKey(_)
            | BrokerError::DuplicateHandler(_)
            | BrokerError::UnsettledDelivery(_) => ErrorKind::Dispatch,
            BrokerError::HandlerError(_) => ErrorKind::Handler,
            BrokerError::InternalError(_)
            | BrokerError::ParsePayloadError(_)
            | BrokerError::CloseError(_) => ErrorKind::Internal,
        }
    }
}
