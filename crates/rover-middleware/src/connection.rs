//! The single operator link.
//!
//! [`ConnectionManager`] owns the raw transport. Nothing else in the process
//! touches it: outbound traffic goes through [`ConnectionManager::send`]
//! (serialised by one async mutex), inbound traffic is pumped into a
//! [`CommandRouter`] by [`ConnectionManager::receive_loop`].
//!
//! Transport errors are never fatal. `connect` retries forever on a fixed
//! backoff and the receive loop reconnects in place whenever the link drops.
//! A link that goes quiet is pinged; if the ping cannot be written or goes
//! unanswered for [`Keepalive::timeout`], the link counts as dropped. Writes
//! share that deadline so a stalled peer cannot hold the send lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rover_types::{ConnectionState, Envelope, RoverError};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::router::CommandRouter;
use crate::transport::{Connector, Frame, FrameSink, FrameStream, WsConnector};

/// Delay between failed connection attempts.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Upper bound on waiting for the peer during a close handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Liveness settings for the operator link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// Inbound silence after which the peer is pinged.
    pub interval: Duration,
    /// How long a ping may go unanswered, and how long any single write may
    /// take, before the link is declared dead.
    pub timeout: Duration,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            timeout: Duration::from_secs(20),
        }
    }
}

/// Anything that can push an envelope to the operator.
///
/// Sensors depend on this rather than on [`ConnectionManager`] so they can be
/// driven against a recording double.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Send one envelope. Returns `false` instead of failing.
    async fn send(&self, envelope: &Envelope) -> bool;
}

/// What the receive loop does with a frame that is not a valid envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedFramePolicy {
    /// Log, then tear the link down and run a full reconnect cycle.
    #[default]
    Reconnect,
    /// Log and keep reading on the same connection.
    Drop,
}

/// Counters for the lifetime of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub reconnects: u64,
}

pub struct ConnectionManager {
    endpoint: String,
    connector: Arc<dyn Connector>,
    backoff: Duration,
    keepalive: Keepalive,
    malformed: MalformedFramePolicy,
    state: watch::Sender<ConnectionState>,
    /// The send lock. At most one frame is in flight at a time.
    outbound: Mutex<Option<FrameSink>>,
    inbound: Mutex<Option<FrameStream>>,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    reconnects: AtomicU64,
}

impl ConnectionManager {
    pub fn new(endpoint: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            endpoint: endpoint.into(),
            connector,
            backoff: DEFAULT_RECONNECT_BACKOFF,
            keepalive: Keepalive::default(),
            malformed: MalformedFramePolicy::default(),
            state,
            outbound: Mutex::new(None),
            inbound: Mutex::new(None),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    /// A manager speaking WebSocket to `endpoint`.
    pub fn websocket(endpoint: impl Into<String>) -> Self {
        Self::new(endpoint, Arc::new(WsConnector))
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_keepalive(mut self, keepalive: Keepalive) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_malformed_policy(mut self, policy: MalformedFramePolicy) -> Self {
        self.malformed = policy;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Establish the link, retrying every backoff interval until it succeeds.
    ///
    /// Any existing link is torn down first. Returns the number of attempts
    /// it took. This never gives up; callers that need to abandon it (e.g.
    /// at shutdown) drop the future.
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn connect(&self) -> u32 {
        self.teardown().await;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.state.send_replace(ConnectionState::Connecting);

            match self.connector.connect(&self.endpoint).await {
                Ok((sink, stream)) => {
                    *self.outbound.lock().await = Some(sink);
                    *self.inbound.lock().await = Some(stream);
                    self.state.send_replace(ConnectionState::Connected);
                    info!(attempt, "connected to operator");
                    return attempt;
                }
                Err(e) => {
                    warn!(
                        attempt,
                        error = %e,
                        retry_in_secs = self.backoff.as_secs_f64(),
                        "connection attempt failed"
                    );
                    time::sleep(self.backoff).await;
                }
            }
        }
    }

    /// Serialise and write `envelope`.
    ///
    /// Returns `false` when there is no live link or the write fails. Never
    /// errors; concurrent callers queue on the send lock. A write that makes
    /// no progress within the keepalive timeout drops the outbound half, so
    /// the next keepalive ping fails and the receive loop reconnects.
    pub async fn send(&self, envelope: &Envelope) -> bool {
        if self.state() != ConnectionState::Connected {
            debug!(kind = %envelope.kind, "not connected, dropping outbound frame");
            return false;
        }

        let frame = match envelope.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "could not serialise outbound envelope");
                return false;
            }
        };

        let mut outbound = self.outbound.lock().await;
        let Some(sink) = outbound.as_mut() else {
            return false;
        };
        let written = time::timeout(self.keepalive.timeout, sink.send(Frame::Text(frame))).await;
        match written {
            Ok(Ok(())) => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(Err(e)) => {
                warn!(kind = %envelope.kind, error = %e, "send failed");
                false
            }
            Err(_) => {
                warn!(
                    kind = %envelope.kind,
                    timeout_secs = self.keepalive.timeout.as_secs_f64(),
                    "send stalled, abandoning outbound half"
                );
                outbound.take();
                false
            }
        }
    }

    /// Write a keepalive ping under the send lock.
    async fn ping(&self) -> Result<(), RoverError> {
        let written = time::timeout(self.keepalive.timeout, async {
            let mut outbound = self.outbound.lock().await;
            match outbound.as_mut() {
                Some(sink) => sink.send(Frame::Ping).await,
                None => Err(RoverError::Transport("no outbound half".to_string())),
            }
        })
        .await;
        match written {
            Ok(result) => result,
            Err(_) => Err(RoverError::Transport("keepalive ping could not be written".to_string())),
        }
    }

    /// Read the next inbound frame.
    async fn next_frame(&self) -> Result<Frame, RoverError> {
        let mut inbound = self.inbound.lock().await;
        let stream = inbound
            .as_mut()
            .ok_or_else(|| RoverError::Transport("no connection".to_string()))?;
        match stream.next().await {
            Some(item) => item,
            None => Err(RoverError::Transport("connection closed by peer".to_string())),
        }
    }

    /// Pump inbound frames into `router` until `shutdown` fires.
    ///
    /// Connects first if needed. A lost link is re-established in place and
    /// the loop carries on; it only returns on cancellation, after closing
    /// the link.
    pub async fn receive_loop(&self, router: &CommandRouter, shutdown: CancellationToken) {
        let mut ping_outstanding = false;
        loop {
            if self.state() != ConnectionState::Connected {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    _ = self.connect() => {
                        ping_outstanding = false;
                        continue;
                    }
                }
            }

            let quiet_limit = if ping_outstanding {
                self.keepalive.timeout
            } else {
                self.keepalive.interval
            };
            let read = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                read = time::timeout(quiet_limit, self.next_frame()) => read,
            };

            let frame = match read {
                Ok(frame) => frame,
                Err(_) if ping_outstanding => Err(RoverError::Transport(format!(
                    "no keepalive reply within {:.1}s",
                    self.keepalive.timeout.as_secs_f64()
                ))),
                Err(_) => {
                    let pinged = tokio::select! {
                        biased;
                        () = shutdown.cancelled() => break,
                        pinged = self.ping() => pinged,
                    };
                    match pinged {
                        Ok(()) => {
                            debug!("link quiet, keepalive ping sent");
                            ping_outstanding = true;
                            continue;
                        }
                        Err(e) => Err(e),
                    }
                }
            };
            if frame.is_ok() {
                ping_outstanding = false;
            }

            match frame {
                Ok(Frame::Text(text)) => {
                    self.frames_received.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = router.route_frame(&text) {
                        self.on_malformed(&e).await;
                    }
                }
                Ok(Frame::Pong) => debug!("keepalive answered"),
                Ok(Frame::Ping) => {}
                Err(e @ RoverError::MalformedMessage(_)) => self.on_malformed(&e).await,
                Err(e) => {
                    warn!(error = %e, "link lost, reconnecting");
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    self.teardown().await;
                }
            }
        }

        self.close().await;
        debug!("receive loop stopped");
    }

    async fn on_malformed(&self, error: &RoverError) {
        match self.malformed {
            MalformedFramePolicy::Drop => {
                warn!(error = %error, "dropping malformed frame");
            }
            MalformedFramePolicy::Reconnect => {
                warn!(error = %error, "malformed frame, reconnecting");
                self.reconnects.fetch_add(1, Ordering::Relaxed);
                self.teardown().await;
            }
        }
    }

    /// Close the link and mark it disconnected. Safe to call repeatedly.
    pub async fn close(&self) {
        self.teardown().await;
        info!(endpoint = %self.endpoint, "link closed");
    }

    async fn teardown(&self) {
        self.state.send_replace(ConnectionState::Disconnected);

        let sink = self.outbound.lock().await.take();
        self.inbound.lock().await.take();

        if let Some(mut sink) = sink {
            match time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "error while closing link"),
                Err(_) => debug!("peer did not acknowledge close in time"),
            }
        }
    }
}

#[async_trait]
impl Outbound for ConnectionManager {
    async fn send(&self, envelope: &Envelope) -> bool {
        ConnectionManager::send(self, envelope).await
    }
}
