//! Connection gateway
//!
//! Per-client state machine driving a real-time connection from handshake
//! to teardown:
//!
//! ```text
//! Connected → Authenticating → Active → Closing → Closed
//! ```
//!
//! Each connection runs a frame-read loop plus a concurrent heartbeat task.
//! The two synchronize on a small shared liveness record (last-activity
//! instant, tick counter, active flag); either side can terminate the
//! connection unilaterally. Every inbound frame refreshes the activity
//! timestamp, so a connection with traffic is never idle-closed.
//!
//! All outbound traffic funnels through one writer task so the relay pump,
//! the heartbeat, and the read loop never contend for the socket.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::StreamExt;
use futures::stream::SplitStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::assignment::AssignmentService;
use crate::authz::{AccessRequest, Authorize, AuthzError};
use crate::config::Config;
use crate::frame::{self, AuthOptions, Frame};
use crate::multiplexer::{Multiplexer, Publisher};
use crate::presence::PresenceStore;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// Policy violation (failed auth, no permissions)
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Internal failure (store or broker trouble)
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Just opened, unauthenticated
    Connected,
    /// Auth frame received, collaborators in flight
    Authenticating,
    /// Authenticated and subscribed
    Active,
    Closing,
    Closed,
}

/// Shared collaborators every connection needs
pub struct Gateway {
    pub assignment: Arc<AssignmentService>,
    pub multiplexer: Arc<Multiplexer>,
    pub authorizer: Arc<dyn Authorize>,
    pub presence: Arc<PresenceStore>,
    pub config: Config,
}

impl Gateway {
    /// Drive one client connection to completion
    pub async fn handle(self: Arc<Self>, socket: WebSocket) {
        let (mut sink, mut stream) = socket.split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Outbound>(64);

        let writer = tokio::spawn(async move {
            use futures::SinkExt;
            while let Some(message) = outgoing_rx.recv().await {
                match message {
                    Outbound::Data(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close { code, reason } => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
        });

        let conn = Arc::new(RoomConn::new(self.clone(), outgoing_tx));

        let hb = conn.clone();
        let heartbeat = tokio::spawn(async move { hb.heartbeat().await });

        conn.read_loop(&mut stream).await;

        // Client went away or the loop aborted; no close frame on this path
        conn.shutdown(None).await;
        heartbeat.abort();
        // The writer drains until every sender is gone; release ours so it
        // can exit when no close frame was queued
        drop(conn);
        let _ = writer.await;
    }
}

/// Frames queued for the writer task
#[derive(Debug)]
enum Outbound {
    Data(String),
    Close { code: u16, reason: String },
}

/// Shared between the read loop and the heartbeat task
struct Liveness {
    last_activity: Mutex<Instant>,
    ticks: AtomicU32,
    active: AtomicBool,
}

impl Liveness {
    fn new() -> Self {
        Self {
            last_activity: Mutex::new(Instant::now()),
            ticks: AtomicU32::new(0),
            active: AtomicBool::new(true),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("liveness lock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("liveness lock poisoned")
            .elapsed()
    }
}

/// Everything the connection holds once a subscription is established
struct Attached {
    session: i64,
    user: i64,
    node_id: i64,
    publisher: Publisher,
    relay: AbortHandle,
}

/// Per-websocket connection state
pub(crate) struct RoomConn {
    gateway: Arc<Gateway>,
    liveness: Liveness,
    state: Mutex<ConnState>,
    attached: Mutex<Option<Attached>>,
    outgoing: mpsc::Sender<Outbound>,
    closed: AtomicBool,
}

/// How the read loop decided to stop
#[derive(Debug, PartialEq, Eq)]
enum Control {
    Continue,
    /// Corrupted frame; abort with no close handshake
    Corrupted,
    /// The gateway already closed the connection
    Done,
}

impl RoomConn {
    fn new(gateway: Arc<Gateway>, outgoing: mpsc::Sender<Outbound>) -> Self {
        Self {
            gateway,
            liveness: Liveness::new(),
            state: Mutex::new(ConnState::Connected),
            attached: Mutex::new(None),
            outgoing,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> ConnState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, state: ConnState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.liveness.active.load(Ordering::Acquire)
    }

    fn is_authenticated(&self) -> bool {
        self.attached
            .lock()
            .expect("attached lock poisoned")
            .is_some()
    }

    async fn read_loop(&self, stream: &mut SplitStream<WebSocket>) {
        while self.is_open() {
            let message = match stream.next().await {
                Some(Ok(message)) => message,
                _ => break,
            };

            self.liveness.touch();

            match message {
                Message::Text(text) => match self.handle_text(text.as_str()).await {
                    Control::Continue => {}
                    Control::Corrupted | Control::Done => break,
                },
                Message::Ping(_) | Message::Pong(_) => {
                    // Control frames count as activity only
                }
                Message::Close(_) => break,
                _ => {
                    debug!("non-text frame, treating connection as corrupted");
                    break;
                }
            }
        }
    }

    /// Dispatch one text frame
    async fn handle_text(&self, text: &str) -> Control {
        match frame::parse(text) {
            Ok(Frame::Auth(options)) => self.handle_auth(options).await,
            Ok(Frame::Msg(payload)) => self.handle_msg(payload).await,
            Err(e) => {
                if e.is_protocol() {
                    debug!(error = %e, "unparsable frame, aborting read loop");
                } else {
                    debug!(error = %e, "invalid auth payload, aborting read loop");
                }
                Control::Corrupted
            }
        }
    }

    /// Authenticate, resolve the session's node, and attach a subscription
    async fn handle_auth(&self, options: AuthOptions) -> Control {
        if self.state() != ConnState::Connected {
            debug!(session = options.script, "duplicate auth frame ignored");
            return Control::Continue;
        }
        self.set_state(ConnState::Authenticating);

        let request = AccessRequest::new(options.script, options.token.clone());
        let permissions = match self.gateway.authorizer.authorize(&request).await {
            Ok(permissions) => permissions,
            Err(AuthzError::Timeout) => {
                warn!(session = options.script, "authorization timed out");
                self.close(CLOSE_POLICY_VIOLATION, "authorization timed out")
                    .await;
                return Control::Done;
            }
            Err(e) => {
                self.close(CLOSE_POLICY_VIOLATION, &e.to_string()).await;
                return Control::Done;
            }
        };

        if permissions.approved.is_empty() {
            self.close(CLOSE_POLICY_VIOLATION, "no permissions").await;
            return Control::Done;
        }

        let node = match self
            .gateway
            .assignment
            .assign_if_absent(options.script)
            .await
        {
            Ok(node) => node,
            Err(e) => {
                warn!(session = options.script, error = %e, "assignment failed");
                self.close(CLOSE_POLICY_VIOLATION, &e.to_string()).await;
                return Control::Done;
            }
        };

        let handle = match self
            .gateway
            .multiplexer
            .subscribe(options.script, permissions.user, &node)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(session = options.script, error = %e, "subscribe failed");
                self.close(CLOSE_INTERNAL_ERROR, &e.to_string()).await;
                return Control::Done;
            }
        };

        self.gateway.presence.join(options.script, permissions.user);

        let publisher = handle.publisher();
        let outgoing = self.outgoing.clone();
        let relay = tokio::spawn(async move {
            let mut handle = handle;
            while let Some(payload) = handle.recv().await {
                let text = String::from_utf8_lossy(&payload).into_owned();
                if outgoing.send(Outbound::Data(text)).await.is_err() {
                    break;
                }
            }
        });

        *self.attached.lock().expect("attached lock poisoned") = Some(Attached {
            session: options.script,
            user: permissions.user,
            node_id: node.id,
            publisher,
            relay: relay.abort_handle(),
        });
        self.set_state(ConnState::Active);

        info!(
            session = options.script,
            user = permissions.user,
            node = node.id,
            "connection active"
        );
        Control::Continue
    }

    /// Relay an opaque payload to the session topic
    async fn handle_msg(&self, payload: &str) -> Control {
        let publisher = {
            let attached = self.attached.lock().expect("attached lock poisoned");
            attached.as_ref().map(|a| a.publisher.clone())
        };

        match publisher {
            Some(publisher) if self.state() == ConnState::Active => {
                if let Err(e) = publisher.publish(payload.as_bytes()).await {
                    warn!(error = %e, "publish failed");
                }
            }
            _ => {
                debug!("msg frame before active, ignoring");
            }
        }
        Control::Continue
    }

    /// Periodic liveness supervision. Runs until the connection closes.
    async fn heartbeat(&self) {
        let mut ticker = tokio::time::interval(self.gateway.config.heartbeat_interval);
        ticker.tick().await; // first tick completes immediately

        while self.is_open() {
            ticker.tick().await;

            if self.liveness.idle_for() > self.gateway.config.activity_timeout {
                self.liveness.active.store(false, Ordering::Release);
                self.close(CLOSE_NORMAL, "no status received").await;
                break;
            }

            let ticks = self.liveness.ticks.fetch_add(1, Ordering::AcqRel) + 1;
            if ticks > self.gateway.config.auth_deadline_ticks && !self.is_authenticated() {
                self.liveness.active.store(false, Ordering::Release);
                self.close(CLOSE_POLICY_VIOLATION, "not authenticated").await;
                break;
            }
        }
    }

    /// Close with a code and human-readable reason, releasing resources
    pub(crate) async fn close(&self, code: u16, reason: &str) {
        self.shutdown(Some((code, reason.to_string()))).await;
    }

    /// Idempotent teardown. Releases the subscription asynchronously, then
    /// optionally sends a close frame.
    async fn shutdown(&self, frame: Option<(u16, String)>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ConnState::Closing);
        self.liveness.active.store(false, Ordering::Release);

        let attached = self.attached.lock().expect("attached lock poisoned").take();
        if let Some(attached) = attached {
            attached.relay.abort();
            self.gateway.presence.leave(attached.session, attached.user);

            let multiplexer = self.gateway.multiplexer.clone();
            tokio::spawn(async move {
                multiplexer.release(attached.session, attached.node_id).await;
            });
        }

        if let Some((code, reason)) = frame {
            debug!(code, reason = %reason, "closing connection");
            let _ = self.outgoing.send(Outbound::Close { code, reason }).await;
        }

        self.set_state(ConnState::Closed);
    }
}
