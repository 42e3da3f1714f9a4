//! Follows a growing log file, line by line.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::stats::{bump, PipelineStats};

/// Reads lines from a file that something else keeps appending to.
///
/// End of file is not the end: the reader waits `poll_interval` and tries
/// again. Only cancellation stops it.
pub struct LineSource {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    poll_interval: Duration,
    progress_every: u64,
}

impl LineSource {
    /// Open `path`, positioned at its current end unless `from_start`.
    pub async fn open(
        path: &Path,
        from_start: bool,
        poll_interval: Duration,
    ) -> anyhow::Result<Self> {
        let mut file = File::open(path)
            .await
            .with_context(|| format!("can't open log file {}", path.display()))?;
        let offset = if from_start {
            0
        } else {
            file.seek(SeekFrom::End(0))
                .await
                .with_context(|| format!("can't seek to end of {}", path.display()))?
        };
        tracing::info!(path = %path.display(), offset, "tailing log file");
        Ok(Self {
            path: path.to_owned(),
            reader: BufReader::new(file),
            offset,
            poll_interval,
            progress_every: 1000,
        })
    }

    /// Log progress every `n` lines.
    pub fn with_progress_every(mut self, n: u64) -> Self {
        self.progress_every = n.max(1);
        self
    }

    /// Wait out one poll interval. False if cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.poll_interval) => true,
        }
    }

    /// Start over if the file shrank underneath us.
    async fn check_truncation(&mut self) {
        let Ok(meta) = tokio::fs::metadata(&self.path).await else {
            return;
        };
        if meta.len() >= self.offset {
            return;
        }
        tracing::warn!(
            path = %self.path.display(),
            offset = self.offset,
            len = meta.len(),
            "log file truncated, reading from the start"
        );
        match self.reader.seek(SeekFrom::Start(0)).await {
            Ok(_) => self.offset = 0,
            Err(e) => tracing::warn!(error = %e, "could not rewind log file"),
        }
    }

    /// The next line, without its terminator. A final line with no newline
    /// yet is returned as-is. `None` only once `cancel` fires.
    pub async fn next_line(&mut self, cancel: &CancellationToken) -> Option<String> {
        let mut buf = Vec::new();
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return None,
                read = self.reader.read_until(b'\n', &mut buf) => read,
            };
            match read {
                Ok(0) if buf.is_empty() => {
                    tracing::trace!(path = %self.path.display(), "end of file, waiting");
                    self.check_truncation().await;
                    if !self.pause(cancel).await {
                        return None;
                    }
                }
                Ok(n) => {
                    self.offset += n as u64;
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if line.is_empty() {
                        buf.clear();
                        continue;
                    }
                    return Some(line);
                }
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "read error, retrying");
                    if !self.pause(cancel).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Feed lines into `lines` until cancelled or the receiver goes away.
    /// A full queue blocks the reader.
    pub async fn run(
        mut self,
        lines: mpsc::Sender<String>,
        cancel: CancellationToken,
        stats: Arc<PipelineStats>,
    ) {
        let mut count: u64 = 0;
        while let Some(line) = self.next_line(&cancel).await {
            tracing::trace!(%line, "line");
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = lines.send(line) => {
                    if sent.is_err() {
                        tracing::warn!("line queue closed");
                        break;
                    }
                }
            }
            count += 1;
            bump(&stats.lines_read);
            if count % self.progress_every == 0 {
                tracing::info!(lines = count, "line source progress");
            }
        }
        tracing::info!(lines = count, path = %self.path.display(), "line source stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const POLL: Duration = Duration::from_millis(20);

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn open_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = LineSource::open(&dir.path().join("nope.log"), true, POLL).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn reads_existing_lines_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "one\r\ntwo\n\nthree").unwrap();
        let cancel = CancellationToken::new();
        let mut src = LineSource::open(&path, true, POLL).await.unwrap();
        assert_eq!(src.next_line(&cancel).await.as_deref(), Some("one"));
        assert_eq!(src.next_line(&cancel).await.as_deref(), Some("two"));
        // Partial last line comes out as-is.
        assert_eq!(src.next_line(&cancel).await.as_deref(), Some("three"));
    }

    #[tokio::test]
    async fn starts_at_end_and_follows_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "old\n").unwrap();
        let cancel = CancellationToken::new();
        let mut src = LineSource::open(&path, false, POLL).await.unwrap();

        let reader = tokio::spawn(async move {
            let line = src.next_line(&cancel).await;
            (line, src)
        });
        tokio::time::sleep(POLL * 3).await;
        assert!(!reader.is_finished(), "EOF must not end the source");
        append(&path, "new\n");
        let (line, _src) = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn cancellation_ends_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "").unwrap();
        let cancel = CancellationToken::new();
        let mut src = LineSource::open(&path, true, Duration::from_secs(3600))
            .await
            .unwrap();
        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { src.next_line(&cancel).await })
        };
        cancel.cancel();
        let line = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, None);
    }

    #[tokio::test]
    async fn rewinds_after_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "first line\n").unwrap();
        let cancel = CancellationToken::new();
        let mut src = LineSource::open(&path, true, POLL).await.unwrap();
        assert_eq!(src.next_line(&cancel).await.as_deref(), Some("first line"));
        std::fs::write(&path, "b\n").unwrap();
        let line = tokio::time::timeout(Duration::from_secs(5), src.next_line(&cancel))
            .await
            .unwrap();
        assert_eq!(line.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn run_forwards_lines_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "a\nb\nc\n").unwrap();
        let cancel = CancellationToken::new();
        let stats = Arc::new(PipelineStats::default());
        let (tx, mut rx) = mpsc::channel(8);
        let src = LineSource::open(&path, true, POLL)
            .await
            .unwrap()
            .with_progress_every(2);
        let task = tokio::spawn(src.run(tx, cancel.clone(), Arc::clone(&stats)));

        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(rx.recv().await.unwrap());
        }
        assert_eq!(got, ["a", "b", "c"]);
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(rx.recv().await, None);
        assert_eq!(stats.snapshot().lines_read, 3);
    }
}
