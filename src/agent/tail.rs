//! Polling file tailer
//!
//! Follows a log file from its end, the way `tail -F` does: the file may not
//! exist yet, and a rotated (replaced) or truncated file is reopened and read
//! from its start.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, trace};

#[derive(Debug)]
pub struct Tailer {
    path: PathBuf,
    file: Option<File>,
    identity: Option<u64>,
    offset: u64,
    /// Bytes after the last newline, completed by a later read
    partial: Vec<u8>,
    /// Only the first opened file is followed from its end
    seek_to_end: bool,
}

impl Tailer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            identity: None,
            offset: 0,
            partial: Vec::new(),
            seek_to_end: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every complete line appended since the last poll. Lines are
    /// trimmed and empty lines dropped.
    pub async fn poll(&mut self) -> std::io::Result<Vec<String>> {
        let metadata = match fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if self.file.take().is_some() {
                    debug!("{} disappeared", self.path.display());
                }
                self.seek_to_end = false;
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let identity = file_identity(&metadata);
        let rotated = self.file.is_some() && identity != self.identity;
        let truncated = metadata.len() < self.offset;
        if self.file.is_none() || rotated || truncated {
            self.reopen(identity, metadata.len()).await?;
        }

        let Some(file) = self.file.as_mut() else {
            return Ok(Vec::new());
        };
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        let read = file.read_to_end(&mut buf).await?;
        self.offset += read as u64;
        if read > 0 {
            trace!("read {read} bytes from {}", self.path.display());
        }

        Ok(self.split_lines(buf))
    }

    async fn reopen(&mut self, identity: Option<u64>, len: u64) -> std::io::Result<()> {
        let file = File::open(&self.path).await?;
        self.offset = if self.seek_to_end { len } else { 0 };
        if self.file.is_some() {
            debug!("reopening {}", self.path.display());
        }
        self.file = Some(file);
        self.identity = identity;
        self.partial.clear();
        self.seek_to_end = false;
        Ok(())
    }

    fn split_lines(&mut self, buf: Vec<u8>) -> Vec<String> {
        self.partial.extend(buf);
        let Some(last_newline) = self.partial.iter().rposition(|byte| *byte == b'\n') else {
            return Vec::new();
        };

        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        String::from_utf8_lossy(&complete)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(unix)]
fn file_identity(metadata: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn file_identity(_metadata: &std::fs::Metadata) -> Option<u64> {
    None
}
