//! Worker stdout/stderr forwarding.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

/// Lines retained for error reports.
pub const TAIL_LINES: usize = 20;

/// Bounded buffer holding the most recent worker output lines.
#[derive(Debug, Clone, Default)]
pub struct OutputTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl OutputTail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        if lines.len() == TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Lines joined for inclusion in an error message; empty when no output.
    pub fn render(&self) -> String {
        self.lines().join("\n")
    }
}

/// Forward every line of `stream` to the log at debug level and into `tail`.
pub fn forward<R>(stream: R, source: &'static str, model: String, tail: OutputTail) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(model = %model, stream = source, "{}", line);
                    tail.push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(model = %model, stream = source, error = %e, "worker output stream failed");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_tail_keeps_last_lines() {
        let tail = OutputTail::new();
        for i in 0..30 {
            tail.push(format!("line {}", i));
        }
        let lines = tail.lines();
        assert_eq!(lines.len(), TAIL_LINES);
        assert_eq!(lines[0], "line 10");
        assert_eq!(lines[19], "line 29");
    }

    #[tokio::test]
    async fn test_forward_collects_lines() {
        let (mut w, r) = tokio::io::duplex(256);
        let tail = OutputTail::new();
        let task = forward(r, "stderr", "fruit".into(), tail.clone());
        w.write_all(b"loading weights\nTraceback: boom\n").await.unwrap();
        drop(w);
        task.await.unwrap();
        assert_eq!(tail.render(), "loading weights\nTraceback: boom");
    }
}
