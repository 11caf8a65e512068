//! In-memory session store
//!
//! Single-process only. Nodes are seeded at startup from configuration;
//! assignments live in a concurrent map and vanish on restart. Sticky
//! assignments are only durable with the postgres backend.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::store::{AssignOutcome, SessionStore, StoreError, WorkerNode};

/// In-memory node registry and assignment table
pub struct MemoryStore {
    /// Registered nodes, in registration order
    nodes: Vec<WorkerNode>,
    /// session_id -> node_id
    assignments: Mutex<HashMap<i64, i64>>,
}

impl MemoryStore {
    /// Create a store with a pre-registered node set
    pub fn new(nodes: Vec<WorkerNode>) -> Self {
        Self {
            nodes,
            assignments: Mutex::new(HashMap::new()),
        }
    }

    /// Seed from `(id, addr)` pairs as parsed from configuration
    pub fn from_pairs(pairs: &[(i64, String)]) -> Self {
        Self::new(
            pairs
                .iter()
                .map(|(id, host)| WorkerNode {
                    id: *id,
                    host: host.clone(),
                })
                .collect(),
        )
    }

    fn find_node(&self, id: i64) -> Option<WorkerNode> {
        self.nodes.iter().find(|n| n.id == id).cloned()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn node(&self, id: i64) -> Result<Option<WorkerNode>, StoreError> {
        Ok(self.find_node(id))
    }

    async fn first_node(&self) -> Result<Option<WorkerNode>, StoreError> {
        Ok(self.nodes.first().cloned())
    }

    async fn node_for_session(&self, session: i64) -> Result<Option<WorkerNode>, StoreError> {
        let assignments = self.assignments.lock().expect("assignments lock poisoned");
        Ok(assignments.get(&session).and_then(|id| self.find_node(*id)))
    }

    async fn assignment_counts(&self) -> Result<Vec<(i64, u64)>, StoreError> {
        let assignments = self.assignments.lock().expect("assignments lock poisoned");
        let mut counts: HashMap<i64, u64> = HashMap::new();
        for node_id in assignments.values() {
            *counts.entry(*node_id).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn insert_assignment(
        &self,
        session: i64,
        node_id: i64,
    ) -> Result<AssignOutcome, StoreError> {
        let mut assignments = self.assignments.lock().expect("assignments lock poisoned");
        match assignments.entry(session) {
            std::collections::hash_map::Entry::Occupied(existing) => {
                Ok(AssignOutcome::AlreadyAssigned(*existing.get()))
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(node_id);
                Ok(AssignOutcome::Inserted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::from_pairs(&[
            (1, "host-1:6379".to_string()),
            (2, "host-2:6379".to_string()),
        ])
    }

    #[tokio::test]
    async fn test_unassigned_session_is_none() {
        let store = store();
        assert_eq!(store.node_for_session(42).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insert_is_first_write_wins() {
        let store = store();
        assert_eq!(
            store.insert_assignment(42, 1).await.unwrap(),
            AssignOutcome::Inserted
        );
        assert_eq!(
            store.insert_assignment(42, 2).await.unwrap(),
            AssignOutcome::AlreadyAssigned(1)
        );

        let node = store.node_for_session(42).await.unwrap().unwrap();
        assert_eq!(node.id, 1);
    }

    #[tokio::test]
    async fn test_counts_group_by_node() {
        let store = store();
        store.insert_assignment(10, 1).await.unwrap();
        store.insert_assignment(11, 1).await.unwrap();
        store.insert_assignment(12, 2).await.unwrap();

        let mut counts = store.assignment_counts().await.unwrap();
        counts.sort();
        assert_eq!(counts, vec![(1, 2), (2, 1)]);
    }
}
