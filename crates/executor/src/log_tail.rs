//! Incremental reads of log files the server is still writing.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    file: Option<File>,
    position: u64,
    partial: Vec<u8>,
}

impl LogTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            position: 0,
            partial: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Complete lines appended since the last call. An incomplete last line
    /// is held back until its newline arrives.
    pub async fn read_new_lines(&mut self) -> std::io::Result<String> {
        self.pull().await?;
        match self.partial.iter().rposition(|b| *b == b'\n') {
            Some(end) => {
                let lines: Vec<u8> = self.partial.drain(..=end).collect();
                Ok(String::from_utf8_lossy(&lines).into_owned())
            }
            None => Ok(String::new()),
        }
    }

    /// Everything not yet handed out, including an incomplete last line.
    pub async fn read_all_pending(&mut self) -> std::io::Result<String> {
        self.pull().await?;
        let rest = std::mem::take(&mut self.partial);
        Ok(String::from_utf8_lossy(&rest).into_owned())
    }

    /// Drop the file handle. Further reads reopen at the saved position.
    pub fn close(&mut self) {
        self.file = None;
    }

    async fn pull(&mut self) -> std::io::Result<()> {
        if self.file.is_none() {
            match File::open(&self.path).await {
                Ok(mut file) => {
                    file.seek(SeekFrom::Start(self.position)).await?;
                    self.file = Some(file);
                }
                // Not created yet: nothing to read.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        if let Some(file) = self.file.as_mut() {
            let n = file.read_to_end(&mut self.partial).await?;
            self.position += n as u64;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
