//! Session store abstraction
//!
//! The durable side of sticky routing: a registry of worker nodes and the
//! session → node assignment table. Assignments are first-write-wins; once a
//! session is placed on a node this subsystem never moves it.
//!
//! # Features
//!
//! Exactly one backend must be enabled at compile time:
//!
//! - `postgres` - worker_nodes / session_assignments tables
//! - `memory` - in-memory maps for single-node/development

#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;

use async_trait::async_trait;

/// A broker-hosting endpoint that owns zero or more sessions.
///
/// Immutable once provisioned; provisioning is out of scope here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerNode {
    pub id: i64,
    /// Network address of the node's broker endpoint
    pub host: String,
}

/// Result of a conditional assignment insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignOutcome {
    /// This caller created the assignment
    Inserted,
    /// Another caller won the race; the session already belongs to this node
    AlreadyAssigned(i64),
}

/// Durable session → node mapping plus the worker node registry
///
/// "Not found" is an empty result, never an error. `StoreError` covers real
/// storage failures only.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Look up a worker node by id
    async fn node(&self, id: i64) -> Result<Option<WorkerNode>, StoreError>;

    /// First registered worker node, if any (cold-start fallback)
    async fn first_node(&self) -> Result<Option<WorkerNode>, StoreError>;

    /// Node currently assigned to a session, if any
    async fn node_for_session(&self, session: i64) -> Result<Option<WorkerNode>, StoreError>;

    /// Assignment counts grouped by node. Nodes with zero assignments do not
    /// appear; an empty result means no assignments exist anywhere.
    async fn assignment_counts(&self) -> Result<Vec<(i64, u64)>, StoreError>;

    /// Insert an assignment if the session has none yet (compare-and-set).
    ///
    /// Concurrent first-time callers for the same session race safely: one
    /// inserts, the rest observe `AlreadyAssigned` with the winner's node.
    async fn insert_assignment(
        &self,
        session: i64,
        node_id: i64,
    ) -> Result<AssignOutcome, StoreError>;
}

/// Storage failure
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
}
