//! PostgreSQL session store
//!
//! Schema (provisioned out of band):
//!
//! ```sql
//! CREATE TABLE worker_nodes (
//!     id   BIGINT PRIMARY KEY,
//!     host TEXT NOT NULL
//! );
//! CREATE TABLE session_assignments (
//!     session_id BIGINT PRIMARY KEY,
//!     node_id    BIGINT NOT NULL REFERENCES worker_nodes (id)
//! );
//! ```
//!
//! The primary key on `session_id` is what makes `insert_assignment` a
//! compare-and-set: concurrent first-time callers race on the unique
//! constraint instead of double-assigning.

use async_trait::async_trait;
use tokio_postgres::{Client, NoTls, Row};

use crate::store::{AssignOutcome, SessionStore, StoreError, WorkerNode};

/// PostgreSQL-backed node registry and assignment table
pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    /// Connect and verify the database is reachable
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("Session store connection error: {}", e);
            }
        });

        client.execute("SELECT 1", &[]).await?;

        Ok(Self { client })
    }

    fn node_from_row(row: &Row) -> WorkerNode {
        WorkerNode {
            id: row.get(0),
            host: row.get(1),
        }
    }
}

fn query_err(e: tokio_postgres::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

#[async_trait]
impl SessionStore for PostgresStore {
    async fn node(&self, id: i64) -> Result<Option<WorkerNode>, StoreError> {
        let row = self
            .client
            .query_opt("SELECT id, host FROM worker_nodes WHERE id = $1", &[&id])
            .await
            .map_err(query_err)?;
        Ok(row.as_ref().map(Self::node_from_row))
    }

    async fn first_node(&self) -> Result<Option<WorkerNode>, StoreError> {
        let row = self
            .client
            .query_opt("SELECT id, host FROM worker_nodes ORDER BY id LIMIT 1", &[])
            .await
            .map_err(query_err)?;
        Ok(row.as_ref().map(Self::node_from_row))
    }

    async fn node_for_session(&self, session: i64) -> Result<Option<WorkerNode>, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT n.id, n.host FROM session_assignments a \
                 JOIN worker_nodes n ON n.id = a.node_id \
                 WHERE a.session_id = $1",
                &[&session],
            )
            .await
            .map_err(query_err)?;
        Ok(row.as_ref().map(Self::node_from_row))
    }

    async fn assignment_counts(&self) -> Result<Vec<(i64, u64)>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT node_id, COUNT(*) FROM session_assignments GROUP BY node_id",
                &[],
            )
            .await
            .map_err(query_err)?;

        Ok(rows
            .iter()
            .map(|row| {
                let node_id: i64 = row.get(0);
                let count: i64 = row.get(1);
                (node_id, count as u64)
            })
            .collect())
    }

    async fn insert_assignment(
        &self,
        session: i64,
        node_id: i64,
    ) -> Result<AssignOutcome, StoreError> {
        let inserted = self
            .client
            .execute(
                "INSERT INTO session_assignments (session_id, node_id) VALUES ($1, $2) \
                 ON CONFLICT (session_id) DO NOTHING",
                &[&session, &node_id],
            )
            .await
            .map_err(query_err)?;

        if inserted == 1 {
            return Ok(AssignOutcome::Inserted);
        }

        // Lost the race; report the winner
        let row = self
            .client
            .query_opt(
                "SELECT node_id FROM session_assignments WHERE session_id = $1",
                &[&session],
            )
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => Ok(AssignOutcome::AlreadyAssigned(row.get(0))),
            None => Err(StoreError::Query(
                "assignment insert conflicted but no row exists".to_string(),
            )),
        }
    }
}
