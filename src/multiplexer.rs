//! Subscription multiplexer
//!
//! Process-wide registry of physical broker connections per worker node.
//! Grants logical subscription handles for (session, node) pairs, reusing
//! or dialing physical connections as needed:
//!
//! - at most one subscription per (session, node); concurrent clients share
//!   it (fan-in via a bounded broadcast channel)
//! - a physical connection carries at most `threshold` subscriptions; when
//!   every connection for a node is at the threshold, a new one is dialed
//! - otherwise the least-loaded connection wins
//!
//! The registry lock covers lookup and mutation only. Dialing happens
//! outside the lock with a re-check afterwards, so a slow network dial
//! never stalls unrelated subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerLink};
use crate::store::WorkerNode;

/// Shares a bounded set of physical broker connections across many logical
/// session subscriptions
pub struct Multiplexer {
    broker: Arc<dyn Broker>,
    /// node id -> physical connections, guarded as a unit
    registry: Mutex<HashMap<i64, Vec<Arc<PhysicalConn>>>>,
    /// Max subscriptions per physical connection
    threshold: usize,
    /// Per-subscription receive buffer depth
    buffer: usize,
    next_conn_id: AtomicU64,
}

struct PhysicalConn {
    id: u64,
    link: Arc<dyn BrokerLink>,
    /// session id -> subscription carried on this connection
    subs: Mutex<HashMap<i64, Subscription>>,
}

struct Subscription {
    tx: broadcast::Sender<Vec<u8>>,
    /// Flips true once the topic subscribe completes; dropped (closing the
    /// channel) when setup fails, so waiting sharers observe the failure
    ready: watch::Sender<bool>,
    /// Inbound pump task; None until the topic subscribe completes
    pump: Option<AbortHandle>,
}

impl PhysicalConn {
    fn load(&self) -> usize {
        self.subs.lock().expect("subs lock poisoned").len()
    }
}

/// Send/receive handle onto a shared session subscription
pub struct SessionHandle {
    pub session: i64,
    pub node_id: i64,
    topic: String,
    rx: broadcast::Receiver<Vec<u8>>,
    link: Arc<dyn BrokerLink>,
}

impl SessionHandle {
    /// Next inbound message for the session, or None once the subscription
    /// is gone. Lagging receivers lose the oldest messages and continue.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(session = self.session, lagged = n, "receiver lagged, dropping oldest");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Publish a payload to the session's topic
    pub async fn publish(&self, payload: &[u8]) -> anyhow::Result<()> {
        self.link.publish(&self.topic, payload).await
    }

    /// Detach a cloneable publish-only side
    pub fn publisher(&self) -> Publisher {
        Publisher {
            topic: self.topic.clone(),
            link: self.link.clone(),
        }
    }
}

/// Publish side of a session subscription, detached from the receive side
#[derive(Clone)]
pub struct Publisher {
    topic: String,
    link: Arc<dyn BrokerLink>,
}

impl Publisher {
    pub async fn publish(&self, payload: &[u8]) -> anyhow::Result<()> {
        self.link.publish(&self.topic, payload).await
    }
}

/// Subscription failure
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("failed to dial broker at {addr}: {reason}")]
    Dial { addr: String, reason: String },
    #[error("failed to subscribe topic {topic}: {reason}")]
    Topic { topic: String, reason: String },
}

/// Where a chosen subscription slot came from
enum Slot {
    /// Subscription already exists; share it. Carries a readiness watch when
    /// the initiator has not finished the topic subscribe yet
    Existing(SessionHandle, Option<watch::Receiver<bool>>),
    /// Fresh slot reserved on this connection; topic subscribe still pending
    Reserved(Arc<PhysicalConn>),
    /// Every connection is at the threshold (or none exists); dial first
    NeedsDial,
}

impl Multiplexer {
    pub fn new(broker: Arc<dyn Broker>, threshold: usize, buffer: usize) -> Self {
        Self {
            broker,
            registry: Mutex::new(HashMap::new()),
            threshold: threshold.max(1),
            buffer: buffer.max(1),
            next_conn_id: AtomicU64::new(1),
        }
    }

    fn topic(session: i64) -> String {
        session.to_string()
    }

    /// Obtain a send/receive handle for a session on its assigned node.
    ///
    /// Concurrency-safe: callers for the same (session, node) end up sharing
    /// one subscription no matter how they interleave. A caller landing on a
    /// subscription whose setup is still in flight waits for the outcome, so
    /// a failed setup errors every sharer instead of handing out handles
    /// backed by nothing.
    pub async fn subscribe(
        &self,
        session: i64,
        user: i64,
        node: &WorkerNode,
    ) -> Result<SessionHandle, SubscribeError> {
        let slot = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            self.reserve_slot(session, node.id, &mut registry)
        };

        let slot = match slot {
            Slot::NeedsDial => {
                let link = self
                    .broker
                    .dial(&node.host)
                    .await
                    .map_err(|e| SubscribeError::Dial {
                        addr: node.host.clone(),
                        reason: e.to_string(),
                    })?;

                let conn = Arc::new(PhysicalConn {
                    id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
                    link,
                    subs: Mutex::new(HashMap::new()),
                });

                // Re-check under the lock: another task may have created the
                // subscription, or freed capacity, while we were dialing
                self.attach_dialed(session, node.id, conn)
            }
            slot => slot,
        };

        match slot {
            Slot::Existing(handle, pending) => {
                if let Some(mut ready) = pending
                    && ready.wait_for(|ok| *ok).await.is_err()
                {
                    return Err(SubscribeError::Topic {
                        topic: Self::topic(session),
                        reason: "subscription setup failed".to_string(),
                    });
                }
                debug!(session, user, node = node.id, "reusing existing subscription");
                Ok(handle)
            }
            Slot::Reserved(conn) => self.activate(session, user, node, conn).await,
            Slot::NeedsDial => unreachable!("attach_dialed always yields a slot"),
        }
    }

    /// Registry lookup/mutation: reuse an existing subscription, or reserve
    /// a slot on a connection with capacity. Runs under the registry lock.
    fn reserve_slot(
        &self,
        session: i64,
        node_id: i64,
        registry: &mut HashMap<i64, Vec<Arc<PhysicalConn>>>,
    ) -> Slot {
        let Some(conns) = registry.get(&node_id) else {
            return Slot::NeedsDial;
        };

        // Fan-in: one subscription per (session, node)
        for conn in conns {
            let subs = conn.subs.lock().expect("subs lock poisoned");
            if let Some(sub) = subs.get(&session) {
                let ready = sub.ready.subscribe();
                let pending = if *ready.borrow() { None } else { Some(ready) };
                return Slot::Existing(
                    SessionHandle {
                        session,
                        node_id,
                        topic: Self::topic(session),
                        rx: sub.tx.subscribe(),
                        link: conn.link.clone(),
                    },
                    pending,
                );
            }
        }

        let candidate = conns
            .iter()
            .filter(|conn| conn.load() < self.threshold)
            .min_by_key(|conn| conn.load());

        match candidate {
            Some(conn) => {
                let reserved = conn.clone();
                reserved
                    .subs
                    .lock()
                    .expect("subs lock poisoned")
                    .insert(session, self.pending_subscription());
                Slot::Reserved(reserved)
            }
            None => Slot::NeedsDial,
        }
    }

    fn pending_subscription(&self) -> Subscription {
        Subscription {
            tx: broadcast::channel(self.buffer).0,
            ready: watch::channel(false).0,
            pump: None,
        }
    }

    /// Attach a freshly dialed connection, unless the registry grew the
    /// capacity to serve the session while we were dialing
    fn attach_dialed(&self, session: i64, node_id: i64, conn: Arc<PhysicalConn>) -> Slot {
        let mut registry = self.registry.lock().expect("registry lock poisoned");

        match self.reserve_slot(session, node_id, &mut registry) {
            Slot::NeedsDial => {
                conn.subs
                    .lock()
                    .expect("subs lock poisoned")
                    .insert(session, self.pending_subscription());

                registry.entry(node_id).or_default().push(conn.clone());
                info!(node = node_id, conn = conn.id, "opened new broker connection");
                Slot::Reserved(conn)
            }
            slot => {
                // The dial was wasted; discard the spare connection
                let spare = conn;
                tokio::spawn(async move { spare.link.close().await });
                slot
            }
        }
    }

    /// Issue the topic subscribe on the reserved slot and start the pump
    async fn activate(
        &self,
        session: i64,
        user: i64,
        node: &WorkerNode,
        conn: Arc<PhysicalConn>,
    ) -> Result<SessionHandle, SubscribeError> {
        let topic = Self::topic(session);

        let mut inbound = match conn.link.subscribe(&topic, self.buffer).await {
            Ok(inbound) => inbound,
            Err(e) => {
                self.drop_reservation(session, node.id, &conn);
                return Err(SubscribeError::Topic {
                    topic,
                    reason: e.to_string(),
                });
            }
        };

        let (tx, rx) = {
            let subs = conn.subs.lock().expect("subs lock poisoned");
            let sub = subs
                .get(&session)
                .expect("reserved subscription disappeared");
            (sub.tx.clone(), sub.tx.subscribe())
        };

        let pump_tx = tx.clone();
        let pump = tokio::spawn(async move {
            while let Some(payload) = inbound.recv().await {
                // send() errs only with no receivers; late joiners resubscribe
                let _ = pump_tx.send(payload);
            }
        });

        {
            let mut subs = conn.subs.lock().expect("subs lock poisoned");
            if let Some(sub) = subs.get_mut(&session) {
                sub.pump = Some(pump.abort_handle());
                sub.ready.send_replace(true);
            } else {
                // Released while we were subscribing
                pump.abort();
            }
        }

        info!(session, user, node = node.id, conn = conn.id, "subscribed");
        Ok(SessionHandle {
            session,
            node_id: node.id,
            topic,
            rx,
            link: conn.link.clone(),
        })
    }

    fn drop_reservation(&self, session: i64, node_id: i64, conn: &Arc<PhysicalConn>) {
        let mut subs = conn.subs.lock().expect("subs lock poisoned");
        subs.remove(&session);
        let now_empty = subs.is_empty();
        drop(subs);

        if now_empty {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            if let Some(conns) = registry.get_mut(&node_id) {
                conns.retain(|c| c.id != conn.id);
                if conns.is_empty() {
                    registry.remove(&node_id);
                }
            }
        }
    }

    /// Tear down the subscription for (session, node): abort the pump,
    /// unsubscribe the topic, and close the physical connection once it
    /// carries nothing else.
    pub async fn release(&self, session: i64, node_id: i64) {
        let cleanup = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            let Some(conns) = registry.get_mut(&node_id) else {
                return;
            };

            let mut found = None;
            for (index, conn) in conns.iter().enumerate() {
                let mut subs = conn.subs.lock().expect("subs lock poisoned");
                if let Some(sub) = subs.remove(&session) {
                    if let Some(pump) = sub.pump {
                        pump.abort();
                    }
                    found = Some((index, conn.clone(), subs.is_empty()));
                    break;
                }
            }

            let Some((index, conn, now_idle)) = found else {
                return;
            };

            if now_idle {
                conns.remove(index);
                if conns.is_empty() {
                    registry.remove(&node_id);
                }
            }
            (conn, now_idle)
        };

        let (conn, now_idle) = cleanup;
        let topic = Self::topic(session);

        if let Err(e) = conn.link.unsubscribe(&topic).await {
            warn!(session, node = node_id, error = %e, "unsubscribe failed");
        }

        if now_idle {
            conn.link.close().await;
            info!(node = node_id, conn = conn.id, "closed idle broker connection");
        }

        debug!(session, node = node_id, "released subscription");
    }

    /// Physical connections currently open for a node
    pub fn connection_count(&self, node_id: i64) -> usize {
        let registry = self.registry.lock().expect("registry lock poisoned");
        registry.get(&node_id).map(|c| c.len()).unwrap_or(0)
    }

    /// Logical subscriptions currently carried for a node
    pub fn subscription_count(&self, node_id: i64) -> usize {
        let registry = self.registry.lock().expect("registry lock poisoned");
        registry
            .get(&node_id)
            .map(|conns| conns.iter().map(|c| c.load()).sum())
            .unwrap_or(0)
    }
}
