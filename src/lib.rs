// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Broker sessions over RabbitMQ with explicit acknowledgement, and a
//! dispatcher routing consumed envelopes to one handler per routing key.
//!
//! ```ignore
//! let mut session = BrokerSession::connect(&Configs::default()).await?;
//! session.bind("orders.direct", "orders.q", "orders.new").await?;
//! session.produce_json(&serde_json::json!({"id": 42})).await?;
//!
//! let dispatcher = Dispatcher::new().register("orders.new", Arc::new(NewOrder))?;
//! dispatcher.poll(&session).await?;
//! ```

mod otel;

pub mod channel;
pub mod configs;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod memory;
pub mod queue;
pub mod session;
pub mod topology;
pub mod transport;

pub use configs::Configs;
pub use dispatcher::Dispatcher;
pub use envelope::{DeliveryHandle, Envelope, HeaderValue, Headers};
pub use errors::{BrokerError, ErrorKind};
pub use handler::{Handler, HandlerContext};
pub use session::{BrokerSession, DeliveryState};
pub use topology::TopologyBinding;
pub use transport::Transport;
