//! Scriptcast - Real-time script session gateway
//!
//! Routes collaborative script sessions from many WebSocket clients to a
//! small pool of worker nodes and multiplexes the resulting pub/sub traffic
//! over a bounded number of physical broker connections.
//!
//! ## Architecture
//!
//! ```text
//! Client (WS) → Gateway → Assignment Service → Session Store
//!                  ↓
//!            Multiplexer → Broker connections (per worker node)
//! ```
//!
//! Three pieces cooperate:
//! - sticky assignment of a session id to a worker node
//! - a multiplexer sharing broker connections across logical subscriptions,
//!   honoring a per-connection load threshold
//! - a per-client gateway state machine (handshake, authorization delegation,
//!   heartbeat liveness, teardown)

// Compile-time feature validation: exactly one backend required
#[cfg(not(any(feature = "postgres", feature = "memory")))]
compile_error!(
    "Scriptcast requires a store/broker backend. Enable: --features postgres OR --features memory"
);

// Enforce mutual exclusivity
#[cfg(all(feature = "postgres", feature = "memory"))]
compile_error!("Only one backend can be enabled. Choose postgres OR memory, not both.");

pub mod assignment;
pub mod authz;
pub mod broker;
pub mod config;
pub mod frame;
pub mod gateway;
pub mod multiplexer;
pub mod presence;
pub mod server;
pub mod store;

pub use assignment::AssignmentService;
pub use authz::{AccessRequest, Authorize, HttpAuthorizer, Permissions};
pub use broker::{Broker, BrokerLink};
pub use config::Config;
pub use frame::{AuthOptions, Frame};
pub use gateway::ConnState;
pub use multiplexer::Multiplexer;
pub use presence::PresenceStore;
pub use store::{SessionStore, WorkerNode};

#[cfg(feature = "postgres")]
pub use broker::PostgresBroker;
#[cfg(feature = "postgres")]
pub use store::PostgresStore;

#[cfg(feature = "memory")]
pub use broker::MemoryBroker;
#[cfg(feature = "memory")]
pub use store::MemoryStore;
