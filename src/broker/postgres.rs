//! PostgreSQL broker backend using LISTEN/NOTIFY
//!
//! Each dial opens one database connection; each topic subscription is a
//! LISTEN on a sanitized channel name. Payloads travel base64-encoded since
//! NOTIFY carries text. Worker node addresses are connection strings for
//! this backend.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_postgres::{AsyncMessage, Client, NoTls};
use tracing::{debug, error, warn};

use crate::broker::{Broker, BrokerLink};

/// Dials LISTEN/NOTIFY connections to worker nodes
pub struct PostgresBroker;

impl PostgresBroker {
    pub fn new() -> Self {
        Self
    }

    /// Sanitize a topic into a valid NOTIFY channel identifier
    fn channel_name(topic: &str) -> String {
        let sanitized: String = topic
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
            .collect();

        // Channel names must not start with a digit
        if sanitized
            .chars()
            .next()
            .map(|c| c.is_ascii_digit())
            .unwrap_or(true)
        {
            format!("ch_{}", sanitized)
        } else {
            sanitized
        }
    }
}

impl Default for PostgresBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for PostgresBroker {
    async fn dial(&self, addr: &str) -> anyhow::Result<Arc<dyn BrokerLink>> {
        let (client, mut connection) = tokio_postgres::connect(addr, NoTls).await?;

        let routes: Arc<DashMap<String, mpsc::Sender<Vec<u8>>>> = Arc::new(DashMap::new());
        let pump_routes = routes.clone();

        // Drive the connection and route notifications to subscribers
        let driver = tokio::spawn(async move {
            loop {
                match std::future::poll_fn(|cx| connection.poll_message(cx)).await {
                    Some(Ok(AsyncMessage::Notification(notification))) => {
                        let Some(tx) = pump_routes.get(notification.channel()) else {
                            continue;
                        };
                        let payload = match BASE64.decode(notification.payload()) {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!(channel = notification.channel(), error = %e, "undecodable notification payload");
                                continue;
                            }
                        };
                        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(payload) {
                            warn!(
                                channel = notification.channel(),
                                "receive buffer full, dropping message"
                            );
                        }
                    }
                    Some(Ok(_)) => {
                        // Notices and parameter changes
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "broker connection error");
                        break;
                    }
                    None => break,
                }
            }
        });

        debug!(addr, "dialed postgres broker node");
        Ok(Arc::new(PostgresLink {
            client,
            routes,
            driver: driver.abort_handle(),
        }))
    }
}

/// One physical LISTEN/NOTIFY connection
pub struct PostgresLink {
    client: Client,
    /// channel name -> subscriber buffer
    routes: Arc<DashMap<String, mpsc::Sender<Vec<u8>>>>,
    driver: AbortHandle,
}

#[async_trait]
impl BrokerLink for PostgresLink {
    async fn subscribe(&self, topic: &str, depth: usize) -> anyhow::Result<mpsc::Receiver<Vec<u8>>> {
        let channel = PostgresBroker::channel_name(topic);
        let (tx, rx) = mpsc::channel(depth.max(1));

        self.routes.insert(channel.clone(), tx);
        if let Err(e) = self.client.batch_execute(&format!("LISTEN {}", channel)).await {
            self.routes.remove(&channel);
            return Err(e.into());
        }

        debug!(topic, channel, "listening");
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()> {
        let channel = PostgresBroker::channel_name(topic);
        self.routes.remove(&channel);
        self.client
            .batch_execute(&format!("UNLISTEN {}", channel))
            .await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
        let channel = PostgresBroker::channel_name(topic);
        let encoded = BASE64.encode(payload);

        // pg_notify for safe parameter binding
        self.client
            .execute("SELECT pg_notify($1, $2)", &[&channel, &encoded])
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.routes.clear();
        self.driver.abort();
    }
}
