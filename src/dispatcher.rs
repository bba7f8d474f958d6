// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! Routes each consumed envelope to the one [`Handler`] registered for its
//! routing key and waits for that handler to finish, settlement included,
//! before the delivery is considered done.
//!
//! Missing handlers are a wiring problem: [`Dispatcher::ensure_routes`] checks
//! a session's routing key before any message is pulled. Failures while
//! dispatching are logged, recorded on the consumer span and returned; the
//! envelope is never acked here.

use crate::{
    envelope::Envelope,
    errors::{BrokerError, ErrorKind},
    handler::{Handler, HandlerContext},
    otel,
    session::{BrokerSession, DeliveryState},
};
use futures_util::future::join_all;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, error};

/// Routing key to handler registry plus the polling loop that feeds it.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher::default()
    }

    /// Registers `handler` for `routing_key`.
    ///
    /// Each key maps to exactly one handler; registering a key twice is a
    /// [`BrokerError::DuplicateHandler`].
    pub fn register(
        mut self,
        routing_key: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<Self, BrokerError> {
        if self.handlers.contains_key(routing_key) {
            return Err(BrokerError::DuplicateHandler(routing_key.to_owned()));
        }

        self.handlers.insert(routing_key.to_owned(), handler);
        Ok(self)
    }

    pub fn routing_keys(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Checks that every key in `keys` has a handler.
    pub fn ensure_keys<'k>(&self, keys: impl IntoIterator<Item = &'k str>) -> Result<(), BrokerError> {
        for key in keys {
            if !self.handlers.contains_key(key) {
                error!(routing_key = key, "no handler registered for routing key");
                return Err(BrokerError::UnregisteredRoutingKey(key.to_owned()));
            }
        }
        Ok(())
    }

    /// Checks that `session` is bound and that its routing key has a handler.
    pub fn ensure_routes(&self, session: &BrokerSession) -> Result<(), BrokerError> {
        let Some(binding) = session.binding() else {
            return Err(BrokerError::ConsumingError(
                "session has no topology binding".to_owned(),
            ));
        };
        self.ensure_keys([binding.routing_key()])
    }

    /// Runs the handler for `envelope` to completion.
    ///
    /// # Parameters
    /// * `session` - The session that delivered `envelope`, handed to the handler for settlement
    /// * `envelope` - A consumed envelope; its routing key selects the handler
    ///
    /// # Returns
    /// `Ok(())` only when the handler returned `Ok` and settled the delivery.
    /// Otherwise the envelope is left exactly as the handler left it and one of
    /// [`BrokerError::UnregisteredRoutingKey`], [`BrokerError::HandlerError`] or
    /// [`BrokerError::UnsettledDelivery`] is returned.
    pub async fn dispatch(
        &self,
        session: &BrokerSession,
        envelope: &Envelope,
    ) -> Result<(), BrokerError> {
        let routing_key = envelope.routing_key();
        let tracer = global::tracer("amqp consumer");
        let (ctx, mut span) = otel::new_span(envelope, &tracer, routing_key);

        debug!(
            "received: {} - message: {}",
            routing_key,
            envelope.id()
        );

        let Some(handler) = self.handlers.get(routing_key) else {
            let err = BrokerError::UnregisteredRoutingKey(routing_key.to_owned());
            error!(
                routing_key,
                message_id = envelope.id(),
                "unsupported routing key, message left unacked"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("unsupported routing key"),
            });
            return Err(err);
        };

        let result = handler
            .handle(&HandlerContext::new(session, envelope, ctx))
            .await;

        if let Err(err) = result {
            error!(
                error = err.to_string(),
                message_id = envelope.id(),
                "error while handling msg, leaving it for redelivery"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("handler failure"),
            });

            return Err(match err {
                BrokerError::HandlerError(_) => err,
                other => BrokerError::HandlerError(other.to_string()),
            });
        }

        match session.delivery_state(envelope).await {
            Some(DeliveryState::Settled) => {
                debug!("message successfully processed");
                span.set_status(Status::Ok);
                Ok(())
            }
            _ => {
                let err = BrokerError::UnsettledDelivery(envelope.id().to_owned());
                error!(
                    message_id = envelope.id(),
                    routing_key,
                    "handler returned without acking the message"
                );
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("message not settled by handler"),
                });
                Err(err)
            }
        }
    }

    /// Pulls one envelope from `session` and dispatches it.
    ///
    /// Returns `Ok(false)` when the queue was empty.
    pub async fn poll(&self, session: &BrokerSession) -> Result<bool, BrokerError> {
        let Some(envelope) = session.consume().await? else {
            return Ok(false);
        };

        self.dispatch(session, &envelope).await?;
        Ok(true)
    }

    /// Polls `session` until `shutdown` turns `true` or its sender goes away.
    ///
    /// One envelope is in flight at a time. An empty queue, or a failure to
    /// pull, backs off for `poll_interval`; a failed dispatch is logged and the
    /// next envelope is pulled right away.
    ///
    /// # Parameters
    /// * `session` - A bound session whose routing key has a handler
    /// * `poll_interval` - Back-off between pulls when there is nothing to do
    /// * `shutdown` - Stop signal
    ///
    /// # Returns
    /// `Ok(())` on shutdown, or the wiring error from
    /// [`Dispatcher::ensure_routes`] before any message is pulled.
    pub async fn run(
        &self,
        session: &BrokerSession,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BrokerError> {
        self.ensure_routes(session)?;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.poll(session).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) if err.kind() == ErrorKind::Consume => {
                    error!(error = err.to_string(), "error consume msg");
                }
                Err(err) => {
                    error!(error = err.to_string(), "error dispatching msg");
                    continue;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(session = %session.id(), "dispatcher stopped");
        Ok(())
    }

    /// Drives one [`Dispatcher::run`] loop per session, concurrently.
    ///
    /// Every session is checked with [`Dispatcher::ensure_routes`] before any
    /// loop starts.
    pub async fn run_all(
        &self,
        sessions: &[BrokerSession],
        poll_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), BrokerError> {
        for session in sessions {
            self.ensure_routes(session)?;
        }

        let loops = sessions
            .iter()
            .map(|session| self.run(session, poll_interval, shutdown.clone()));

        for res in join_all(loops).await {
            res?;
        }

        Ok(())
    }
}
