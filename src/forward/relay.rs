//! Bidirectional WebSocket message relay.
//!
//! [`relay`] splits both endpoints and runs two copy loops through the
//! [`UnitLimiter`], one per direction. Message type is preserved and order is
//! kept within each direction. Each loop closes its destination when it ends;
//! the first loop to end completes the relay and the other one is aborted.

use std::fmt;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::limiter::{LimiterClosed, UnitLimiter};

/// Transport-neutral WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<(u16, String)>),
}

/// A message type that can be carried across the relay.
pub trait WireMessage: Sized {
    /// `None` for frames that have no meaning on the other side.
    fn into_frame(self) -> Option<Frame>;
    fn from_frame(frame: Frame) -> Self;
}

impl WireMessage for Frame {
    fn into_frame(self) -> Option<Frame> {
        Some(self)
    }

    fn from_frame(frame: Frame) -> Self {
        frame
    }
}

impl WireMessage for AxumMessage {
    fn into_frame(self) -> Option<Frame> {
        Some(match self {
            Self::Text(t) => Frame::Text(t.as_str().to_owned()),
            Self::Binary(b) => Frame::Binary(b),
            Self::Ping(b) => Frame::Ping(b),
            Self::Pong(b) => Frame::Pong(b),
            Self::Close(c) => Frame::Close(c.map(|c| (c.code, c.reason.as_str().to_owned()))),
        })
    }

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(t) => Self::Text(t.into()),
            Frame::Binary(b) => Self::Binary(b),
            Frame::Ping(b) => Self::Ping(b),
            Frame::Pong(b) => Self::Pong(b),
            Frame::Close(c) => Self::Close(c.map(|(code, reason)| AxumCloseFrame {
                code,
                reason: reason.into(),
            })),
        }
    }
}

impl WireMessage for WsMessage {
    fn into_frame(self) -> Option<Frame> {
        match self {
            Self::Text(t) => Some(Frame::Text(t.as_str().to_owned())),
            Self::Binary(b) => Some(Frame::Binary(b)),
            Self::Ping(b) => Some(Frame::Ping(b)),
            Self::Pong(b) => Some(Frame::Pong(b)),
            Self::Close(c) => Some(Frame::Close(
                c.map(|c| (u16::from(c.code), c.reason.as_str().to_owned())),
            )),
            // Raw frames only appear when writing.
            Self::Frame(_) => None,
        }
    }

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(t) => Self::Text(t.into()),
            Frame::Binary(b) => Self::Binary(b),
            Frame::Ping(b) => Self::Ping(b),
            Frame::Pong(b) => Self::Pong(b),
            Frame::Close(c) => Self::Close(c.map(|(code, reason)| WsCloseFrame {
                code: code.into(),
                reason: reason.into(),
            })),
        }
    }
}

/// Which way a copy loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

/// Why a copy loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyEnd {
    /// The source sent a close frame, which was forwarded.
    Closed,
    /// The source stream ended without a close frame.
    Eof,
    ReadError(String),
    WriteError(String),
}

impl fmt::Display for CopyEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Eof => f.write_str("disconnected"),
            Self::ReadError(e) => write!(f, "read error: {e}"),
            Self::WriteError(e) => write!(f, "write error: {e}"),
        }
    }
}

/// Copy messages from `src` to `dst` until either side fails or closes.
pub async fn copy<S, SM, SE, D, DM>(mut src: S, mut dst: D) -> CopyEnd
where
    S: Stream<Item = Result<SM, SE>> + Unpin,
    SM: WireMessage,
    SE: fmt::Display,
    D: Sink<DM> + Unpin,
    D::Error: fmt::Display,
    DM: WireMessage,
{
    let end = loop {
        let msg = match src.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => break CopyEnd::ReadError(e.to_string()),
            None => break CopyEnd::Eof,
        };
        let Some(frame) = msg.into_frame() else {
            continue;
        };
        let is_close = matches!(frame, Frame::Close(_));
        if let Err(e) = dst.send(DM::from_frame(frame)).await {
            break CopyEnd::WriteError(e.to_string());
        }
        if is_close {
            break CopyEnd::Closed;
        }
    };
    let _ = dst.close().await;
    end
}

/// Relay between `client` and `backend` until one direction ends.
///
/// Returns the direction that finished first and why.
pub async fn relay<A, AM, AE, B, BM, BE>(
    client: A,
    backend: B,
    limiter: &UnitLimiter,
) -> Result<(Direction, CopyEnd), LimiterClosed>
where
    A: Stream<Item = Result<AM, AE>> + Sink<AM, Error = AE> + Send + 'static,
    AM: WireMessage + Send + 'static,
    AE: fmt::Display + Send + 'static,
    B: Stream<Item = Result<BM, BE>> + Sink<BM, Error = BE> + Send + 'static,
    BM: WireMessage + Send + 'static,
    BE: fmt::Display + Send + 'static,
{
    let (client_sink, client_stream) = client.split();
    let (backend_sink, backend_stream) = backend.split();
    let (done_tx, mut done_rx) = mpsc::channel(2);

    let up_done = done_tx.clone();
    let up = limiter
        .spawn(async move {
            let end = copy(client_stream, backend_sink).await;
            let _ = up_done.send((Direction::ClientToBackend, end)).await;
        })
        .await?;

    let down_done = done_tx;
    let down = match limiter
        .spawn(async move {
            let end = copy(backend_stream, client_sink).await;
            let _ = down_done.send((Direction::BackendToClient, end)).await;
        })
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            up.abort();
            return Err(e);
        }
    };

    // Both senders live in the loops, so `None` means both were cancelled.
    let first = done_rx
        .recv()
        .await
        .unwrap_or((Direction::ClientToBackend, CopyEnd::Eof));
    up.abort();
    down.abort();
    Ok(first)
}
