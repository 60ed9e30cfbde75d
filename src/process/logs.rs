//! Bounded console history plus a live broadcast of new lines.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Lines written by the host itself (commands sent, lifecycle notes).
    Host,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub seq: u64,
    pub stream: LogStream,
    pub line: String,
    pub at: DateTime<Utc>,
}

struct LogRing {
    lines: VecDeque<LogLine>,
    capacity: usize,
    next_seq: u64,
}

pub struct LogBuffer {
    ring: Mutex<LogRing>,
    live: broadcast::Sender<LogLine>,
}

impl LogBuffer {
    pub fn new(capacity: usize, subscriber_backlog: usize) -> Self {
        let (live, _) = broadcast::channel(subscriber_backlog.max(1));
        Self {
            ring: Mutex::new(LogRing {
                lines: VecDeque::with_capacity(capacity.min(4096)),
                capacity: capacity.max(1),
                next_seq: 0,
            }),
            live,
        }
    }

    pub fn push(&self, stream: LogStream, line: impl Into<String>) {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let entry = LogLine {
            seq: ring.next_seq,
            stream,
            line: line.into(),
            at: Utc::now(),
        };
        ring.next_seq += 1;
        if ring.lines.len() == ring.capacity {
            ring.lines.pop_front();
        }
        ring.lines.push_back(entry.clone());
        // Sent under the lock so `seq` order matches delivery order.
        let _ = self.live.send(entry);
        drop(ring);
    }

    /// Snapshot plus a receiver that continues exactly after it.
    pub fn subscribe(&self) -> (Vec<LogLine>, broadcast::Receiver<LogLine>) {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let rx = self.live.subscribe();
        let recent = ring.lines.iter().cloned().collect();
        drop(ring);
        (recent, rx)
    }

    /// Receiver for new lines only.
    pub fn follow(&self) -> broadcast::Receiver<LogLine> {
        self.live.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_newest_lines() {
        let buffer = LogBuffer::new(3, 8);
        for i in 0..5 {
            buffer.push(LogStream::Stdout, format!("line {i}"));
        }
        let (recent, _) = buffer.subscribe();
        let lines: Vec<_> = recent.iter().map(|l| l.line.as_str()).collect();
        assert_eq!(lines, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(recent[0].seq, 2);
    }

    #[tokio::test]
    async fn subscribers_continue_after_snapshot() {
        let buffer = LogBuffer::new(10, 8);
        buffer.push(LogStream::Stdout, "before");
        let (snapshot, mut rx) = buffer.subscribe();
        buffer.push(LogStream::Stderr, "after");

        assert_eq!(snapshot.len(), 1);
        let next = rx.recv().await.unwrap();
        assert_eq!(next.line, "after");
        assert_eq!(next.seq, snapshot[0].seq + 1);
    }

    #[tokio::test]
    async fn slow_subscribers_lag_instead_of_blocking() {
        let buffer = LogBuffer::new(100, 2);
        let mut rx = buffer.follow();
        for i in 0..5 {
            buffer.push(LogStream::Stdout, format!("{i}"));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(rx.recv().await.unwrap().line, "3");
    }
}
