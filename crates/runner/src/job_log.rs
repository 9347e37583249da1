use std::io;
use std::path::{Path, PathBuf};

use microci_core::log::{section_line, stderr_line};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Append-only, line oriented job log.
///
/// Both output readers of a running script write through the same handle, so
/// each line lands whole. Every line is flushed as written so readers tailing
/// the file see progress.
#[derive(Debug)]
pub struct JobLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JobLog {
    /// Creates (or truncates) the log file at `path`.
    pub async fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::create(&path).await?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    /// Opens an existing log for appending, creating it if missing.
    pub async fn open_append(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    /// A handle on a log that is already complete and will not be written.
    pub fn closed(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line. `line` must not contain a newline.
    pub async fn write_line(&self, line: &str) -> io::Result<()> {
        let mut guard = self.file.lock().await;
        let Some(file) = guard.as_mut() else {
            return Err(io::Error::other("job log is closed"));
        };
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        file.write_all(&buf).await?;
        file.flush().await
    }

    /// Starts a new section titled `title`.
    pub async fn section(&self, title: &str) -> io::Result<()> {
        self.write_line(&section_line(title)).await
    }

    /// Appends a line tagged as stderr.
    pub async fn stderr(&self, text: &str) -> io::Result<()> {
        self.write_line(&stderr_line(text)).await
    }

    /// Flushes and closes the file. Closing twice is a no-op.
    pub async fn close(&self) -> io::Result<()> {
        let file = self.file.lock().await.take();
        match file {
            Some(mut file) => {
                file.flush().await?;
                file.sync_all().await
            }
            None => Ok(()),
        }
    }

    /// Whether the log still accepts writes.
    pub async fn is_open(&self) -> bool {
        self.file.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_lines_and_rejects_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let log = JobLog::create(dir.path().join("logs")).await.unwrap();
        log.section("Build").await.unwrap();
        log.write_line("hello").await.unwrap();
        log.stderr("oops").await.unwrap();
        log.close().await.unwrap();
        log.close().await.unwrap();

        assert!(!log.is_open().await);
        let err = log.write_line("late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert_eq!(err.to_string(), "job log is closed");

        let text = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(text, "[[microci-section]]Build\nhello\n[[stderr]]oops\n");
    }

    #[tokio::test]
    async fn open_append_keeps_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs");
        std::fs::write(&path, "first\n").unwrap();

        let log = JobLog::open_append(&path).await.unwrap();
        log.write_line("second").await.unwrap();
        log.close().await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }
}
