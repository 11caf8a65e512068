//! Session assignment service
//!
//! Decides which worker node owns a session and records the decision.
//! Routing is sticky: every participant in a session must land on the same
//! node so they share one broker channel, and an assignment is never moved
//! once written.

use std::sync::Arc;

use tracing::{debug, info};

use crate::store::{AssignOutcome, SessionStore, StoreError, WorkerNode};

/// Sticky session → worker node placement
pub struct AssignmentService {
    store: Arc<dyn SessionStore>,
}

impl AssignmentService {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Currently assigned node for a session, if any
    pub async fn resolve(&self, session: i64) -> Result<Option<WorkerNode>, AssignError> {
        Ok(self.store.node_for_session(session).await?)
    }

    /// Resolve the session's node, assigning one if it has none yet.
    ///
    /// Placement picks the node with the fewest assigned sessions, lowest
    /// node id among ties. With no assignments anywhere (cold start) the
    /// first registered node wins. The insert is a compare-and-set: when a
    /// concurrent caller assigns the same brand-new session first, the
    /// winner's node is returned instead of double-assigning.
    pub async fn assign_if_absent(&self, session: i64) -> Result<WorkerNode, AssignError> {
        if let Some(node) = self.resolve(session).await? {
            debug!(session, node = node.id, "session already assigned");
            return Ok(node);
        }

        let target = self.pick_node().await?;

        match self.store.insert_assignment(session, target.id).await? {
            AssignOutcome::Inserted => {
                info!(session, node = target.id, host = %target.host, "session assigned");
                Ok(target)
            }
            AssignOutcome::AlreadyAssigned(winner) => {
                debug!(session, node = winner, "lost assignment race");
                self.store
                    .node(winner)
                    .await?
                    .ok_or(AssignError::UnknownNode(winner))
            }
        }
    }

    /// Least-loaded node by assignment count, falling back to the first
    /// registered node when no assignments exist anywhere
    async fn pick_node(&self) -> Result<WorkerNode, AssignError> {
        let counts = self.store.assignment_counts().await?;

        let chosen = counts
            .iter()
            .min_by_key(|(node_id, count)| (*count, *node_id))
            .map(|(node_id, _)| *node_id);

        match chosen {
            Some(node_id) => self
                .store
                .node(node_id)
                .await?
                .ok_or(AssignError::UnknownNode(node_id)),
            None => self
                .store
                .first_node()
                .await?
                .ok_or(AssignError::NoNodes),
        }
    }
}

/// Assignment failure
#[derive(Debug, thiserror::Error)]
pub enum AssignError {
    #[error("no worker nodes are registered")]
    NoNodes,
    #[error("assignment references unregistered node {0}")]
    UnknownNode(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn service(nodes: &[(i64, &str)]) -> AssignmentService {
        let pairs: Vec<(i64, String)> = nodes
            .iter()
            .map(|(id, host)| (*id, host.to_string()))
            .collect();
        AssignmentService::new(Arc::new(MemoryStore::from_pairs(&pairs)))
    }

    #[tokio::test]
    async fn test_cold_start_picks_first_node() {
        let svc = service(&[(7, "host-1"), (2, "host-2")]);
        let node = svc.assign_if_absent(42).await.unwrap();
        assert_eq!(node.host, "host-1");
    }

    #[tokio::test]
    async fn test_assignment_is_sticky() {
        let svc = service(&[(1, "host-1"), (2, "host-2")]);

        let first = svc.assign_if_absent(42).await.unwrap();
        let second = svc.assign_if_absent(42).await.unwrap();
        assert_eq!(first, second);

        let resolved = svc.resolve(42).await.unwrap().unwrap();
        assert_eq!(resolved, first);
    }

    #[tokio::test]
    async fn test_least_loaded_node_wins() {
        let store = Arc::new(MemoryStore::from_pairs(&[
            (1, "a".to_string()),
            (2, "b".to_string()),
            (3, "c".to_string()),
        ]));

        // A:3, B:1, C:5
        for session in [10, 11, 12] {
            store.insert_assignment(session, 1).await.unwrap();
        }
        store.insert_assignment(20, 2).await.unwrap();
        for session in [30, 31, 32, 33, 34] {
            store.insert_assignment(session, 3).await.unwrap();
        }

        let svc = AssignmentService::new(store);
        let node = svc.assign_if_absent(99).await.unwrap();
        assert_eq!(node.id, 2);
    }

    #[tokio::test]
    async fn test_ties_break_to_lowest_node_id() {
        let store = Arc::new(MemoryStore::from_pairs(&[
            (3, "c".to_string()),
            (1, "a".to_string()),
            (2, "b".to_string()),
        ]));
        store.insert_assignment(10, 2).await.unwrap();
        store.insert_assignment(11, 3).await.unwrap();
        store.insert_assignment(12, 1).await.unwrap();

        let svc = AssignmentService::new(store);
        let node = svc.assign_if_absent(99).await.unwrap();
        assert_eq!(node.id, 1);
    }

    /// Store whose conditional insert always reports a concurrent winner
    struct TakenStore {
        nodes: Vec<WorkerNode>,
        winner: i64,
    }

    #[async_trait::async_trait]
    impl SessionStore for TakenStore {
        async fn node(&self, id: i64) -> Result<Option<WorkerNode>, StoreError> {
            Ok(self.nodes.iter().find(|n| n.id == id).cloned())
        }

        async fn first_node(&self) -> Result<Option<WorkerNode>, StoreError> {
            Ok(self.nodes.first().cloned())
        }

        async fn node_for_session(&self, _session: i64) -> Result<Option<WorkerNode>, StoreError> {
            Ok(None)
        }

        async fn assignment_counts(&self) -> Result<Vec<(i64, u64)>, StoreError> {
            Ok(Vec::new())
        }

        async fn insert_assignment(
            &self,
            _session: i64,
            _node_id: i64,
        ) -> Result<AssignOutcome, StoreError> {
            Ok(AssignOutcome::AlreadyAssigned(self.winner))
        }
    }

    fn taken_store(winner: i64) -> Arc<TakenStore> {
        Arc::new(TakenStore {
            nodes: vec![
                WorkerNode {
                    id: 1,
                    host: "host-1".to_string(),
                },
                WorkerNode {
                    id: 2,
                    host: "host-2".to_string(),
                },
            ],
            winner,
        })
    }

    #[tokio::test]
    async fn test_lost_insert_race_adopts_winner() {
        let svc = AssignmentService::new(taken_store(2));
        let node = svc.assign_if_absent(42).await.unwrap();
        assert_eq!(node.id, 2);
        assert_eq!(node.host, "host-2");
    }

    #[tokio::test]
    async fn test_lost_race_to_unregistered_node_is_an_error() {
        let svc = AssignmentService::new(taken_store(9));
        assert!(matches!(
            svc.assign_if_absent(42).await,
            Err(AssignError::UnknownNode(9))
        ));
    }

    #[tokio::test]
    async fn test_no_nodes_is_an_error() {
        let svc = service(&[]);
        assert!(matches!(
            svc.assign_if_absent(42).await,
            Err(AssignError::NoNodes)
        ));
    }

    #[tokio::test]
    async fn test_unassigned_resolve_is_none() {
        let svc = service(&[(1, "host-1")]);
        assert_eq!(svc.resolve(42).await.unwrap(), None);
    }
}
