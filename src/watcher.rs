use crate::error::{HarnessError, Result};
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn, Instrument};

/// Lines kept for diagnostics per watched stream.
pub const ROLLING_LOG_LINES: usize = 512;

#[derive(Debug, Clone)]
pub struct LogLine {
    pub at: DateTime<Local>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Latch {
    Pending,
    Matched(String),
    Closed,
}

struct Inner {
    log: VecDeque<LogLine>,
    latches: Vec<(String, watch::Sender<Latch>)>,
    closed: bool,
}

impl Inner {
    fn latch(&mut self, token: &str) -> &watch::Sender<Latch> {
        if let Some(idx) = self.latches.iter().position(|(t, _)| t == token) {
            return &self.latches[idx].1;
        }
        let initial = match self.log.iter().find(|l| l.text.contains(token)) {
            Some(line) => Latch::Matched(line.text.clone()),
            None if self.closed => Latch::Closed,
            None => Latch::Pending,
        };
        let (tx, _) = watch::channel(initial);
        self.latches.push((token.to_string(), tx));
        &self.latches[self.latches.len() - 1].1
    }

    fn observe(&mut self, text: String) {
        for (token, latch) in &self.latches {
            let pending = *latch.borrow() == Latch::Pending;
            if pending && text.contains(token.as_str()) {
                latch.send_replace(Latch::Matched(text.clone()));
            }
        }
        if self.log.len() == ROLLING_LOG_LINES {
            self.log.pop_front();
        }
        self.log.push_back(LogLine { at: Local::now(), text });
    }

    fn close(&mut self) {
        self.closed = true;
        for (_, latch) in &self.latches {
            let pending = *latch.borrow() == Latch::Pending;
            if pending {
                latch.send_replace(Latch::Closed);
            }
        }
    }
}

/// Watches a process output stream for readiness tokens.
///
/// A background task drains the stream into a rolling log and resolves a
/// one-shot latch per token; callers block on the latch with a deadline.
pub struct LogWatcher {
    name: String,
    first_token: Option<String>,
    shared: Arc<Mutex<Inner>>,
    drained: watch::Receiver<bool>,
}

fn lock(shared: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LogWatcher {
    /*
        @@@
        @attach();
        . Registers a latch for every token, then spawns the reader task on the current runtime.
        . The reader splits on newlines (lossy UTF-8), logs each line at DEBUG and feeds the latches.
        . When the stream closes every latch still pending is marked closed and the task ends.
    */
    pub fn attach<R>(name: impl Into<String>, stream: R, tokens: &[&str]) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let name = name.into();
        let mut inner = Inner {
            log: VecDeque::with_capacity(64),
            latches: Vec::with_capacity(tokens.len()),
            closed: false,
        };
        for token in tokens {
            inner.latch(token);
        }
        let shared = Arc::new(Mutex::new(inner));

        let reader_shared = shared.clone();
        let reader_name = name.clone();
        let (drained_tx, drained) = watch::channel(false);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::with_capacity(256);
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&buf)
                            .trim_end_matches(['\r', '\n'])
                            .to_string();
                        debug!(process = %reader_name, "{}", text);
                        lock(&reader_shared).observe(text);
                    }
                    Err(e) => {
                        warn!(process = %reader_name, error = %e, "output stream read failed");
                        break;
                    }
                }
            }
            debug!(process = %reader_name, "output stream closed");
            lock(&reader_shared).close();
            drained_tx.send_replace(true);
        }.in_current_span());

        Self {
            name,
            first_token: tokens.first().map(|t| t.to_string()),
            shared,
            drained,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the first token given to [`LogWatcher::attach`].
    pub async fn wait_for_result(&self, limit: Duration) -> Result<String> {
        match &self.first_token {
            Some(token) => self.wait_for(token, limit).await,
            None => Err(HarnessError::Config(format!(
                "watcher for `{}` has no token to wait for",
                self.name
            ))),
        }
    }

    /*
        @@@
        @wait_for();
        . Returns the first line containing `token`, blocking at most `limit`.
        . Once matched, later calls return the same line immediately.
        . Fails with ReadinessTimeout on deadline, or as soon as the stream closes without a match.
        . Tokens given to attach() see every line; a token first asked for here only sees the
          last ROLLING_LOG_LINES lines already read.
    */
    pub async fn wait_for(&self, token: &str, limit: Duration) -> Result<String> {
        let mut rx = lock(&self.shared).latch(token).subscribe();

        let outcome = match timeout(limit, rx.wait_for(|l| *l != Latch::Pending)).await {
            Ok(Ok(latch)) => match &*latch {
                Latch::Matched(line) => Ok(line.clone()),
                _ => Err("output closed before the token appeared"),
            },
            Ok(Err(_)) => Err("watcher dropped"),
            Err(_) => Err(""),
        };

        outcome.map_err(|reason| {
            let mut detail = String::new();
            if !reason.is_empty() {
                detail.push_str(": ");
                detail.push_str(reason);
            }
            let tail = self.tail(5);
            if !tail.is_empty() {
                detail.push_str("; last output:\n");
                detail.push_str(&tail);
            }
            HarnessError::ReadinessTimeout {
                process: self.name.clone(),
                token: token.to_string(),
                waited: limit,
                detail,
            }
        })
    }

    /// Waits until the reader has consumed the whole stream, up to `limit`.
    pub async fn drained(&self, limit: Duration) -> bool {
        let mut rx = self.drained.clone();
        let done = matches!(timeout(limit, rx.wait_for(|done| *done)).await, Ok(Ok(_)));
        done
    }

    pub fn has_seen(&self, token: &str) -> bool {
        lock(&self.shared).log.iter().any(|l| l.text.contains(token))
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared).closed
    }

    /// Rolling log, oldest first, prefixed with the time each line was read.
    pub fn recent_lines(&self) -> Vec<String> {
        lock(&self.shared)
            .log
            .iter()
            .map(|l| format!("{} {}", l.at.format("%H:%M:%S%.3f"), l.text))
            .collect()
    }

    /// Last `n` raw lines joined with newlines.
    pub fn tail(&self, n: usize) -> String {
        let inner = lock(&self.shared);
        let skip = inner.log.len().saturating_sub(n);
        inner
            .log
            .iter()
            .skip(skip)
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Instant;
    use tokio::io::AsyncWriteExt;
    use tracing_test::traced_test;

    fn cursor(text: &str) -> Cursor<Vec<u8>> {
        Cursor::new(text.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn matches_token_and_latches() {
        let watcher = LogWatcher::attach(
            "mongod",
            cursor("starting\n[initandlisten] waiting for connections on port 37017\n"),
            &["waiting for connections"],
        );
        let line = watcher.wait_for_result(Duration::from_secs(2)).await.unwrap();
        assert!(line.contains("port 37017"));

        // latch stays resolved
        let started = Instant::now();
        let again = watcher.wait_for_result(Duration::from_secs(2)).await.unwrap();
        assert_eq!(line, again);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn times_out_when_token_never_appears() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let watcher = LogWatcher::attach("quiet", reader, &["ready"]);
        writer.write_all(b"still booting\n").await.unwrap();

        let started = Instant::now();
        let err = watcher.wait_for_result(Duration::from_millis(200)).await.unwrap_err();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2));
        match err {
            HarnessError::ReadinessTimeout { token, detail, .. } => {
                assert_eq!(token, "ready");
                assert!(detail.contains("still booting"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        drop(writer);
    }

    #[tokio::test]
    async fn token_written_later_releases_waiter() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let watcher = LogWatcher::attach("late", reader, &["replSet PRIMARY"]);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            writer.write_all(b"member is now in state ").await.unwrap();
            writer.write_all(b"replSet PRIMARY\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let line = watcher.wait_for_result(Duration::from_secs(3)).await.unwrap();
        assert_eq!(line, "member is now in state replSet PRIMARY");
    }

    #[tokio::test]
    async fn closed_stream_fails_fast() {
        let watcher = LogWatcher::attach("crashed", cursor("fatal: dbpath missing\n"), &["ready"]);

        let started = Instant::now();
        let err = watcher.wait_for_result(Duration::from_secs(10)).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(err.to_string().contains("closed"));
        assert!(watcher.is_closed());
    }

    #[tokio::test]
    async fn late_registered_token_sees_history() {
        let watcher = LogWatcher::attach("history", cursor("one\ntwo\nSuccessfully added user\n"), &[]);
        let line = watcher
            .wait_for("Successfully added user", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(line, "Successfully added user");
        assert!(watcher.has_seen("two"));
        assert!(watcher.wait_for_result(Duration::from_millis(10)).await.is_err());
    }

    #[tokio::test]
    async fn attached_token_survives_log_rollover() {
        let mut text = String::from("[initandlisten] waiting for connections\n");
        text.extend((0..ROLLING_LOG_LINES * 2).map(|i| format!("noise {i}\n")));
        let watcher = LogWatcher::attach("busy", Cursor::new(text.into_bytes()), &["waiting for connections"]);
        assert!(watcher.drained(Duration::from_secs(2)).await);

        assert!(!watcher.has_seen("waiting for connections"));
        let line = watcher
            .wait_for("waiting for connections", Duration::from_millis(100))
            .await
            .unwrap();
        assert!(line.starts_with("[initandlisten]"));
        // not attached: the line has already left the rolling log
        assert!(watcher.wait_for("noise 0", Duration::from_millis(100)).await.is_err());
    }

    #[tokio::test]
    async fn drained_reports_end_of_stream() {
        let (writer, reader) = tokio::io::duplex(64);
        let watcher = LogWatcher::attach("pipe", reader, &[]);
        assert!(!watcher.drained(Duration::from_millis(100)).await);
        drop(writer);
        assert!(watcher.drained(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn rolling_log_is_bounded() {
        let text: String = (0..ROLLING_LOG_LINES + 10).map(|i| format!("line {i}\n")).collect();
        let watcher = LogWatcher::attach("chatty", Cursor::new(text.into_bytes()), &["never"]);
        let _ = watcher.wait_for_result(Duration::from_secs(2)).await;

        let lines = watcher.recent_lines();
        assert_eq!(lines.len(), ROLLING_LOG_LINES);
        assert!(lines[0].ends_with("line 10"));
        assert_eq!(watcher.tail(1), format!("line {}", ROLLING_LOG_LINES + 9));
    }

    #[tokio::test]
    #[traced_test]
    async fn output_is_mirrored_to_tracing() {
        let watcher = LogWatcher::attach("echo", cursor("hello from child\n"), &["hello"]);
        watcher.wait_for_result(Duration::from_secs(2)).await.unwrap();
        assert!(logs_contain("hello from child"));
    }
}
