//! Broker connection abstraction
//!
//! A worker node hosts a broker endpoint; the multiplexer dials a small
//! number of physical connections to it and carries many logical topic
//! subscriptions on each. Backends implement dialing and the per-connection
//! topic operations.
//!
//! # Features
//!
//! Exactly one backend must be enabled at compile time:
//!
//! - `postgres` - LISTEN/NOTIFY, one connection per dial
//! - `memory` - process-local topic channels for single-node/development

#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "postgres")]
pub use postgres::PostgresBroker;

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "memory")]
pub use memory::MemoryBroker;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Dials physical connections to a worker node's broker endpoint
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new physical connection. Potentially slow (network dial);
    /// callers must not hold registry locks across this.
    async fn dial(&self, addr: &str) -> anyhow::Result<Arc<dyn BrokerLink>>;
}

/// One live physical connection to a broker endpoint
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Subscribe to a topic. Inbound messages arrive on the returned
    /// receiver, buffered to `depth`; when the buffer is full the message is
    /// dropped with a warning rather than stalling the whole connection.
    async fn subscribe(&self, topic: &str, depth: usize) -> anyhow::Result<mpsc::Receiver<Vec<u8>>>;

    /// Stop delivering a topic on this connection
    async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()>;

    /// Publish a payload to a topic
    async fn publish(&self, topic: &str, payload: &[u8]) -> anyhow::Result<()>;

    /// Tear the physical connection down
    async fn close(&self);
}
