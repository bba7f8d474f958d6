// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Binding
//!
//! A session routes through exactly one exchange/queue/routing key triple.
//! Installing it declares a durable direct exchange, a durable queue and the
//! binding between them. Declarations converge, so installing the same
//! binding any number of times leaves the broker in the same state.

use crate::{
    errors::BrokerError, exchange::ExchangeDefinition, queue::QueueDefinition,
    transport::Transport,
};
use tracing::debug;

/// The exchange, queue and routing key a session produces to and consumes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopologyBinding {
    exchange: String,
    queue: String,
    routing_key: String,
}

impl TopologyBinding {
    /// Validates and builds a binding. None of the names may be empty.
    pub fn new(exchange: &str, queue: &str, routing_key: &str) -> Result<Self, BrokerError> {
        if exchange.is_empty() {
            return Err(BrokerError::InvalidBinding("exchange"));
        }
        if queue.is_empty() {
            return Err(BrokerError::InvalidBinding("queue"));
        }
        if routing_key.is_empty() {
            return Err(BrokerError::InvalidBinding("routing key"));
        }

        Ok(TopologyBinding {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
        })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub(crate) fn exchange_definition(&self) -> ExchangeDefinition {
        ExchangeDefinition::direct(&self.exchange).durable()
    }

    pub(crate) fn queue_definition(&self) -> QueueDefinition {
        QueueDefinition::new(&self.queue).durable()
    }

    /// Declares the exchange, then the queue, then binds them.
    pub(crate) async fn install(&self, transport: &dyn Transport) -> Result<(), BrokerError> {
        transport
            .declare_exchange(&self.exchange_definition())
            .await?;
        transport.declare_queue(&self.queue_definition()).await?;
        transport
            .bind_queue(&self.queue, &self.exchange, &self.routing_key)
            .await?;

        debug!(
            exchange = %self.exchange,
            queue = %self.queue,
            routing_key = %self.routing_key,
            "topology installed"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use mockall::{predicate::eq, Sequence};

    #[test]
    fn rejects_empty_names() {
        assert_eq!(
            TopologyBinding::new("", "q", "k"),
            Err(BrokerError::InvalidBinding("exchange"))
        );
        assert_eq!(
            TopologyBinding::new("e", "", "k"),
            Err(BrokerError::InvalidBinding("queue"))
        );
        assert_eq!(
            TopologyBinding::new("e", "q", ""),
            Err(BrokerError::InvalidBinding("routing key"))
        );
    }

    #[tokio::test]
    async fn installs_durable_direct_topology_in_order() {
        let binding = TopologyBinding::new("orders.direct", "orders.q", "orders.new").unwrap();
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();

        transport
            .expect_declare_exchange()
            .withf(|def| def.name() == "orders.direct" && def.is_durable() && !def.is_auto_delete())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        transport
            .expect_declare_queue()
            .withf(|def| def.name() == "orders.q" && def.is_durable())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        transport
            .expect_bind_queue()
            .with(eq("orders.q"), eq("orders.direct"), eq("orders.new"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        binding.install(&transport).await.unwrap();
    }

    #[tokio::test]
    async fn stops_at_the_first_rejected_declaration() {
        let binding = TopologyBinding::new("ex", "q", "k").unwrap();
        let mut transport = MockTransport::new();

        transport
            .expect_declare_exchange()
            .returning(|def| Err(BrokerError::DeclareExchangeError(def.name().to_owned())));
        transport.expect_declare_queue().never();
        transport.expect_bind_queue().never();

        let err = binding.install(&transport).await.unwrap_err();
        assert_eq!(err, BrokerError::DeclareExchangeError("ex".into()));
    }
}
