//! Per-job log file with a hard byte cap.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::{Result, WorkerError};

pub const TRUNCATION_NOTICE: &str =
    "\n\n====================\n[fls] LOG TRUNCATED: output exceeded the log limit\n====================\n";

/// Longest worker note written to the log.
pub const MAX_NOTE_BYTES: usize = 64 * 1024;

/// Cut `text` to at most `max` bytes, on a char boundary, marking the cut.
pub fn clip(text: &str, max: usize) -> Cow<'_, str> {
    if text.len() <= max {
        return Cow::Borrowed(text);
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(format!("{}... ({} bytes clipped)", &text[..end], text.len() - end))
}

/// Append-only log shared by the build and grade phases.
///
/// Container output goes through [`JobLog::append`], which stops writing
/// once `limit` bytes have been accepted and writes the truncation notice
/// exactly once. Worker-authored markers use [`JobLog::note`] and are never
/// dropped.
pub struct JobLog {
    path: PathBuf,
    file: File,
    written: u64,
    limit: u64,
    truncated: bool,
}

impl JobLog {
    pub async fn open(path: &Path, limit: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| WorkerError::environment(format!("failed to open {}", path.display()), e))?;
        let written = file
            .metadata()
            .await
            .map_err(|e| WorkerError::environment("failed to stat job log", e))?
            .len();

        Ok(Self {
            path: path.to_path_buf(),
            file,
            written,
            limit,
            truncated: false,
        })
    }

    /// Append captured container output, honouring the cap.
    pub async fn append(&mut self, chunk: &[u8]) -> Result<()> {
        if self.truncated {
            return Ok(());
        }

        let room = self.limit.saturating_sub(self.written);
        if (chunk.len() as u64) <= room {
            self.write(chunk).await?;
            self.written += chunk.len() as u64;
            return Ok(());
        }

        let head = &chunk[..room as usize];
        self.write(head).await?;
        self.written += head.len() as u64;
        self.write(TRUNCATION_NOTICE.as_bytes()).await?;
        self.truncated = true;
        self.flush().await
    }

    pub async fn note(&mut self, text: &str) -> Result<()> {
        let text = clip(text, MAX_NOTE_BYTES);
        let mut line = String::with_capacity(text.len() + 7);
        line.push_str("[fls] ");
        line.push_str(&text);
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.write(line.as_bytes()).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(|e| WorkerError::environment("failed to flush job log", e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.file
            .write_all(bytes)
            .await
            .map_err(|e| WorkerError::environment("failed to write job log", e))
    }
}
