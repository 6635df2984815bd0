//! Bounded, sequenced ring of server output lines.
//!
//! The drain tasks push every stdout/stderr line here so the server
//! never blocks on a full pipe; operators poll with a cursor.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::support::env_usize;

const DEFAULT_LOG_MAX_LINES: usize = 1000;

fn log_max_lines() -> usize {
    env_usize("WARDEN_LOG_MAX_LINES")
        .map(|v| v.clamp(100, 50_000))
        .unwrap_or(DEFAULT_LOG_MAX_LINES)
}

#[derive(Debug)]
pub struct LogBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, String)>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self {
            next_seq: 1,
            max_lines: log_max_lines(),
            lines: VecDeque::new(),
        }
    }
}

impl LogBuffer {
    pub fn push_line(&mut self, line: String) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    /// Lines after `cursor`, at most `limit`, plus the new cursor.
    /// Cursor 0 means "the most recent `limit` lines".
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in self.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in self.lines.iter() {
            if *seq > cursor {
                out.push(line.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }
}

/// Cheap handle the drain tasks clone.
#[derive(Clone, Debug, Default)]
pub struct LogSink {
    buffer: Arc<Mutex<LogBuffer>>,
}

impl LogSink {
    pub fn buffer(&self) -> Arc<Mutex<LogBuffer>> {
        self.buffer.clone()
    }

    pub async fn emit(&self, line: impl Into<String>) {
        self.buffer.lock().await.push_line(line.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_after_cursor_returns_only_newer() {
        let mut buf = LogBuffer::default();
        for i in 1..=5 {
            buf.push_line(format!("line {i}"));
        }

        let (lines, cursor) = buf.tail_after(0, 2);
        assert_eq!(lines, vec!["line 4".to_string(), "line 5".to_string()]);
        assert_eq!(cursor, 5);

        let (lines, cursor) = buf.tail_after(3, 10);
        assert_eq!(lines, vec!["line 4".to_string(), "line 5".to_string()]);
        assert_eq!(cursor, 5);

        let (lines, cursor) = buf.tail_after(5, 10);
        assert!(lines.is_empty());
        assert_eq!(cursor, 5);
    }

    #[test]
    fn ring_drops_oldest() {
        let mut buf = LogBuffer {
            next_seq: 1,
            max_lines: 3,
            lines: VecDeque::new(),
        };
        for i in 1..=5 {
            buf.push_line(format!("l{i}"));
        }
        let (lines, _) = buf.tail_after(0, 10);
        assert_eq!(lines, vec!["l3".to_string(), "l4".to_string(), "l5".to_string()]);
    }
}
