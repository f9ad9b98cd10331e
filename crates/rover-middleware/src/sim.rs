//! In-memory loopback transport.
//!
//! [`LoopbackConnector`] stands in for a live operator server. Every
//! successful `connect` hands a fresh [`LoopbackPeer`] to the test through an
//! mpsc channel; the peer plays the server side of that one connection.
//! Dropping the peer ends the rover's inbound stream, which the connection
//! manager sees as a lost link. Pings are answered by the loopback itself
//! until the peer goes silent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use futures_util::{future, sink, stream};
use rover_types::{Envelope, RoverError};
use tokio::sync::mpsc;

use crate::transport::{Connector, Frame, FrameSink, FrameStream};

type Inbound = Result<Frame, RoverError>;

/// Rover-side write path of one loopback connection.
struct Wire {
    to_peer: mpsc::UnboundedSender<String>,
    /// Weak so a dropped peer still ends the rover's inbound stream.
    pongs: mpsc::WeakUnboundedSender<Inbound>,
    silent: Arc<AtomicBool>,
}

impl Wire {
    async fn write(self, frame: Frame) -> Result<Self, RoverError> {
        let silent = self.silent.load(Ordering::SeqCst);
        match frame {
            Frame::Text(_) if silent => future::pending::<()>().await,
            Frame::Text(text) => self
                .to_peer
                .send(text)
                .map_err(|_| RoverError::Transport("loopback peer closed".to_string()))?,
            Frame::Ping if !silent => {
                if let Some(pongs) = self.pongs.upgrade() {
                    let _ = pongs.send(Ok(Frame::Pong));
                }
            }
            Frame::Ping | Frame::Pong => {}
        }
        Ok(self)
    }
}

/// Scriptable in-memory [`Connector`]. Clones share counters.
#[derive(Clone)]
pub struct LoopbackConnector {
    peers: mpsc::UnboundedSender<LoopbackPeer>,
    fail_remaining: Arc<AtomicU32>,
    attempts: Arc<AtomicU32>,
}

impl LoopbackConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LoopbackPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                fail_remaining: Arc::new(AtomicU32::new(0)),
                attempts: Arc::new(AtomicU32::new(0)),
            },
            rx,
        )
    }

    /// Refuse the next `n` connection attempts.
    pub fn failing_first(self, n: u32) -> Self {
        self.fail_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// Connection attempts seen so far, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, endpoint: &str) -> Result<(FrameSink, FrameStream), RoverError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RoverError::Transport(format!(
                "loopback refused connection to {endpoint}"
            )));
        }

        let (to_peer, from_rover) = mpsc::unbounded_channel::<String>();
        let (to_rover, from_peer) = mpsc::unbounded_channel::<Inbound>();
        let silent = Arc::new(AtomicBool::new(false));
        let wire = Wire {
            to_peer,
            pongs: to_rover.downgrade(),
            silent: Arc::clone(&silent),
        };

        self.peers
            .send(LoopbackPeer {
                tx: to_rover,
                rx: from_rover,
                silent,
            })
            .map_err(|_| RoverError::Transport("loopback listener is gone".to_string()))?;

        let sink = sink::unfold(wire, |wire, frame: Frame| wire.write(frame));
        let stream = stream::unfold(from_peer, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Server side of one loopback connection.
pub struct LoopbackPeer {
    tx: mpsc::UnboundedSender<Inbound>,
    rx: mpsc::UnboundedReceiver<String>,
    silent: Arc<AtomicBool>,
}

impl LoopbackPeer {
    /// Deliver a raw frame to the rover. Returns `false` once the rover has
    /// dropped its end.
    pub fn send_text(&self, frame: impl Into<String>) -> bool {
        self.tx.send(Ok(Frame::Text(frame.into()))).is_ok()
    }

    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        match envelope.to_json() {
            Ok(frame) => self.send_text(frame),
            Err(_) => false,
        }
    }

    /// Make the rover's next read fail with `error`.
    pub fn inject_error(&self, error: RoverError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    /// Behave like a peer that dropped off the network without closing:
    /// rover writes stall and pings go unanswered. The connection itself
    /// stays open.
    pub fn go_silent(&self) {
        self.silent.store(true, Ordering::SeqCst);
    }

    /// Next frame written by the rover, or `None` once the rover closed the
    /// connection.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}
