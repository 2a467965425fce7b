//! Inbound log-stream transport
//!
//! Agents push batches of lines as frames. The client actor only sees a
//! [`FrameStream`]; the websocket implementation lives in the API module and
//! [`channel_stream`] provides an in-memory one.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// A stream of inbound frames, each one JSON array of log lines
#[async_trait]
pub trait FrameStream: Send {
    /// Next frame payload. `None` once the peer closed the stream.
    async fn recv_frame(&mut self) -> Option<Result<Vec<u8>>>;

    /// Close the stream; later calls are no-ops
    async fn close(&mut self);

    /// Remote address, for logging
    fn peer(&self) -> String;
}

/// Decode one frame into its lines
pub fn decode_batch(frame: &[u8]) -> Result<Vec<String>> {
    Ok(serde_json::from_slice(frame)?)
}

/// Sending half of an in-memory [`FrameStream`]
#[derive(Debug, Clone)]
pub struct FrameSender {
    sender: mpsc::UnboundedSender<Result<Vec<u8>>>,
}

impl FrameSender {
    /// Send a batch of lines as one frame; false once the stream is closed
    pub fn send_lines<I, L>(&self, lines: I) -> bool
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        match serde_json::to_vec(&lines) {
            Ok(frame) => self.send_frame(frame),
            Err(_) => false,
        }
    }

    pub fn send_frame(&self, frame: Vec<u8>) -> bool {
        self.sender.send(Ok(frame)).is_ok()
    }

    pub fn send_error(&self, message: impl Into<String>) -> bool {
        self.sender.send(Err(Error::Transport(message.into()))).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Resolves once the receiving side closed or dropped the stream
    pub async fn closed(&self) {
        self.sender.closed().await
    }
}

/// In-memory [`FrameStream`] fed by a [`FrameSender`]
#[derive(Debug)]
pub struct ChannelStream {
    peer: String,
    receiver: mpsc::UnboundedReceiver<Result<Vec<u8>>>,
}

pub fn channel_stream(peer: impl Into<String>) -> (FrameSender, ChannelStream) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        FrameSender { sender },
        ChannelStream {
            peer: peer.into(),
            receiver,
        },
    )
}

#[async_trait]
impl FrameStream for ChannelStream {
    async fn recv_frame(&mut self) -> Option<Result<Vec<u8>>> {
        self.receiver.recv().await
    }

    async fn close(&mut self) {
        self.receiver.close();
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}
