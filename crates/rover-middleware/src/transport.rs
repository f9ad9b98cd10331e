//! Transport seam between the [`ConnectionManager`] and the network.
//!
//! A [`Connector`] turns an endpoint address into a pair of [`Frame`]
//! halves. Production uses [`WsConnector`] (WebSocket messages); tests use
//! the loopback connector from [`crate::sim`].
//!
//! [`ConnectionManager`]: crate::connection::ConnectionManager

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::future;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use rover_types::RoverError;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// One unit of traffic on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A serialised envelope.
    Text(String),
    /// Keepalive request. A live peer answers with [`Frame::Pong`].
    Ping,
    Pong,
}

/// Outbound half of a connection: accepts one complete frame per item.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = RoverError> + Send>>;

/// Inbound half of a connection: yields one complete frame per item.
///
/// A transport error or a close from the peer is reported as an `Err` item;
/// the end of the stream also means the connection is gone.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, RoverError>> + Send>>;

/// Establishes duplex connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`RoverError::Transport`] when the connection cannot be
    /// established.
    async fn connect(&self, endpoint: &str) -> Result<(FrameSink, FrameStream), RoverError>;
}

/// WebSocket client connector.
///
/// Envelopes travel as text messages; inbound UTF-8 binary messages are
/// accepted too. Pings from the server are answered by the protocol layer
/// and never reach the caller, pongs are surfaced so the keepalive can see
/// them.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<(FrameSink, FrameStream), RoverError> {
        let (ws, _response) = connect_async(endpoint)
            .await
            .map_err(|e| RoverError::Transport(format!("connect to {endpoint}: {e}")))?;
        let (ws_tx, ws_rx) = ws.split();

        let sink = ws_tx
            .sink_map_err(|e| RoverError::Transport(format!("ws send: {e}")))
            .with(|frame: Frame| future::ready(Ok::<_, RoverError>(ws_message(frame))));

        let stream = ws_rx.filter_map(|msg| future::ready(ws_frame(msg)));

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

fn ws_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Ping => Message::Ping(Vec::new().into()),
        Frame::Pong => Message::Pong(Vec::new().into()),
    }
}

fn ws_frame(
    msg: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<Frame, RoverError>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
        Ok(Message::Binary(bytes)) => Some(
            String::from_utf8(bytes.to_vec())
                .map(Frame::Text)
                .map_err(|e| RoverError::MalformedMessage(format!("binary frame is not UTF-8: {e}"))),
        ),
        Ok(Message::Pong(_)) => Some(Ok(Frame::Pong)),
        Ok(Message::Close(frame)) => Some(Err(RoverError::Transport(match frame {
            Some(frame) => format!("closed by peer: {} {}", frame.code, frame.reason.as_str()),
            None => "closed by peer".to_string(),
        }))),
        Ok(_) => None,
        Err(e) => Some(Err(RoverError::Transport(format!("ws receive: {e}")))),
    }
}
