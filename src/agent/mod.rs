//! Remote tailing agent
//!
//! The agent is launched by the hub over SSH with base64 encoded
//! [`AgentParams`]. It tails one log file and pushes the new lines to the hub
//! over a websocket, as binary frames holding a JSON array of strings.
//!
//! ## Message Flow
//!
//! ```text
//! poll tick → Tailer::poll → Batcher::push ──(1024 lines)──► flush
//! flush tick (5s) ──────────► Batcher::take ────────────────► flush
//! ```
//!
//! The timed flush is sent even when nothing was buffered; the empty frame
//! keeps the hub's read deadline from expiring on a quiet log. Every failure
//! ends the agent; the hub provisions a new one on its next monitor tick.

pub mod params;
pub mod tail;

use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::{SinkExt, StreamExt};
use tokio::time::{interval, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, instrument, trace};

pub use params::{AgentParams, ParamsError};
pub use tail::Tailer;

/// Lines that trigger an immediate flush
pub const BATCH_LINES: usize = 1024;
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Buffers lines until a full batch is ready or a flush is due
#[derive(Debug)]
pub struct Batcher {
    lines: Vec<String>,
    capacity: usize,
}

impl Default for Batcher {
    fn default() -> Self {
        Self::new(BATCH_LINES)
    }
}

impl Batcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Buffer `line`, returning the batch once it is full
    pub fn push(&mut self, line: String) -> Option<Vec<String>> {
        self.lines.push(line);
        (self.lines.len() >= self.capacity).then(|| self.drain())
    }

    /// Take whatever is buffered, possibly nothing
    pub fn take(&mut self) -> Vec<String> {
        self.drain()
    }

    fn drain(&mut self) -> Vec<String> {
        std::mem::replace(&mut self.lines, Vec::with_capacity(self.capacity))
    }
}

/// Tail `params.log_path` and stream it to the hub until something fails
#[instrument(skip_all, fields(log_path = %params.log_path))]
pub async fn run(params: AgentParams) -> Result<()> {
    let mut tailer = Tailer::new(&params.log_path);
    // position at the current end before connecting
    tailer
        .poll()
        .await
        .with_context(|| format!("failed to open {}", params.log_path))?;

    debug!("connecting to {}", params.web_socket_addr);
    let (socket, _) = timeout(CONNECT_TIMEOUT, connect_async(params.web_socket_addr.as_str()))
        .await
        .context("websocket connect timed out")?
        .with_context(|| format!("failed to connect to {}", params.web_socket_addr))?;
    info!("connected to hub");

    let (mut write, mut read) = socket.split();
    let mut batcher = Batcher::default();
    let mut poll_ticker = interval(POLL_INTERVAL);
    let mut flush_ticker = interval(FLUSH_INTERVAL);

    loop {
        let batches: Vec<Vec<String>> = tokio::select! {
            _ = poll_ticker.tick() => {
                let lines = tailer.poll().await.context("failed to read log file")?;
                lines.into_iter().filter_map(|line| batcher.push(line)).collect()
            }

            _ = flush_ticker.tick() => vec![batcher.take()],

            message = read.next() => match message {
                Some(Ok(Message::Close(_))) | None => bail!("hub closed the connection"),
                Some(Err(e)) => bail!("websocket error: {e}"),
                Some(Ok(_)) => Vec::new(),
            },
        };

        for batch in batches {
            let frame = serde_json::to_vec(&batch).context("failed to encode batch")?;
            trace!("sending {} lines", batch.len());
            timeout(WRITE_DEADLINE, write.send(Message::Binary(frame)))
                .await
                .context("websocket write timed out")?
                .context("websocket write failed")?;
        }
    }
}
