//! Incremental file tailing
//!
//! A tail starts at the end of the file as first seen, so existing content
//! is skipped. Truncation or rotation (a different inode) restarts reading
//! from offset zero. A trailing partial line is left for the next read,
//! unless it fills the whole read window; such a line is skipped up to its
//! newline.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::warn;

/// Upper bound on bytes pulled from one file per read
const MAX_READ_BYTES: u64 = 1024 * 1024;

#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    position: Option<u64>,
    file_id: Option<u64>,
    /// Inside an overlong line; discard bytes until its newline
    skipping: bool,
}

impl LogTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            position: None,
            file_id: None,
            skipping: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Anchor at the current end of file. A missing file anchors at zero
    /// once it appears.
    pub async fn prime(&mut self) {
        if let Ok(meta) = tokio::fs::metadata(&self.path).await {
            self.position = Some(meta.len());
            self.file_id = file_id(&meta);
        }
    }

    /// Read up to `max_lines` complete lines appended since the last call
    pub async fn read_new_lines(&mut self, max_lines: usize) -> io::Result<Vec<String>> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let id = file_id(&meta);
        let mut position = match self.position {
            Some(pos) if id == self.file_id && meta.len() >= pos => pos,
            _ => {
                self.skipping = false;
                0
            }
        };
        self.file_id = id;
        if meta.len() == position {
            self.position = Some(position);
            return Ok(Vec::new());
        }

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(position)).await?;
        let mut buf = Vec::new();
        file.take(MAX_READ_BYTES).read_to_end(&mut buf).await?;

        let mut consumed = 0usize;
        if self.skipping {
            match buf.iter().position(|b| *b == b'\n') {
                Some(end) => {
                    consumed = end + 1;
                    self.skipping = false;
                }
                None => {
                    self.position = Some(position + buf.len() as u64);
                    return Ok(Vec::new());
                }
            }
        }

        let mut lines = Vec::new();
        for raw in buf[consumed..].split_inclusive(|b| *b == b'\n') {
            if lines.len() >= max_lines || raw.last() != Some(&b'\n') {
                break;
            }
            consumed += raw.len();
            let text = String::from_utf8_lossy(raw);
            let text = text.trim_end_matches(['\n', '\r']);
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }

        if buf.len() as u64 == MAX_READ_BYTES && !buf.contains(&b'\n') {
            warn!(
                path = %self.path.display(),
                window = MAX_READ_BYTES,
                "Line longer than the read window, skipping to its end"
            );
            consumed = buf.len();
            self.skipping = true;
        }

        position += consumed as u64;
        self.position = Some(position);
        Ok(lines)
    }
}

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_id(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}
