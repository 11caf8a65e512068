//! In-memory broker backend
//!
//! Single-process only. Each "node" is a named set of topic channels inside
//! this broker; dialing the same address twice yields two links onto the
//! same node, which is exactly the shape the multiplexer exercises.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::broker::{Broker, BrokerLink};

/// In-memory broker with process-local nodes
pub struct MemoryBroker {
    nodes: DashMap<String, Arc<MemoryNode>>,
}

struct MemoryNode {
    addr: String,
    topics: DashMap<String, broadcast::Sender<Vec<u8>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
        }
    }

    fn node(&self, addr: &str) -> Arc<MemoryNode> {
        self.nodes
            .entry(addr.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryNode {
                    addr: addr.to_string(),
                    topics: DashMap::new(),
                })
            })
            .clone()
    }

    /// Inject a message into a node's topic, as a broker-side publisher would
    pub fn inject(&self, addr: &str, topic: &str, payload: &[u8]) {
        self.node(addr).publish(topic, payload);
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNode {
    fn topic_sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    fn publish(&self, topic: &str, payload: &[u8]) {
        // send() errs only when no link is subscribed; fire and forget
        let _ = self.topic_sender(topic).send(payload.to_vec());
    }

    fn drop_if_idle(&self, topic: &str) {
        if let Some(sender) = self.topics.get(topic)
            && sender.receiver_count() == 0
        {
            drop(sender);
            self.topics.remove(topic);
            debug!(addr = %self.addr, topic, "removed idle topic");
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn dial(&self, addr: &str) -> anyhow::Result<Arc<dyn BrokerLink>> {
        debug!(addr, "dialed in-memory broker node");
        Ok(Arc::new(MemoryLink {
            node: self.node(addr),
            pumps: DashMap::new(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One logical "physical connection" onto an in-memory node
pub struct MemoryLink {
    node: Arc<MemoryNode>,
    /// topic -> inbound pump task
    pumps: DashMap<String, AbortHandle>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerLink for MemoryLink {
    async fn subscribe(&self, topic: &str, depth: usize) -> anyhow::Result<mpsc::Receiver<Vec<u8>>> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("link is closed");
        }

        let mut rx = self.node.topic_sender(topic).subscribe();
        let (out_tx, out_rx) = mpsc::channel(depth.max(1));
        let addr = self.node.addr.clone();
        let topic_name = topic.to_string();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        if let Err(mpsc::error::TrySendError::Full(_)) = out_tx.try_send(payload) {
                            warn!(addr = %addr, topic = %topic_name, "receive buffer full, dropping message");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(addr = %addr, topic = %topic_name, lagged = n, "subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.pumps.insert(topic.to_string(), handle.abort_handle());
        Ok(out_rx)
    }

    async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()> {
        if let Some((_, pump)) = self.pumps.remove(topic) {
            pump.abort();
        }
        self.node.drop_if_idle(topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("link is closed");
        }
        self.node.publish(topic, payload);
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let topics: Vec<String> = self.pumps.iter().map(|e| e.key().clone()).collect();
        for topic in topics {
            if let Some((_, pump)) = self.pumps.remove(&topic) {
                pump.abort();
            }
            self.node.drop_if_idle(&topic);
        }
        debug!(addr = %self.node.addr, "link closed");
    }
}
