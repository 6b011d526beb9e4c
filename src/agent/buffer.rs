//! Bounded output history for agents
//!
//! Keeps the most recent command output of each agent in memory so status
//! polls can return the last lines without touching the log file.

use std::collections::VecDeque;

/// Last `capacity` bytes of an agent's output stream
pub struct OutputTail {
    bytes: VecDeque<u8>,
    capacity: usize,
    /// Set once anything has been evicted
    truncated: bool,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            truncated: false,
        }
    }

    /// Append, evicting the oldest bytes past capacity
    pub fn push(&mut self, data: &[u8]) {
        if data.len() >= self.capacity {
            self.truncated |= !data.is_empty() || !self.bytes.is_empty();
            self.bytes.clear();
            self.bytes.extend(&data[data.len() - self.capacity..]);
            return;
        }
        let overflow = (self.bytes.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.bytes.drain(..overflow);
            self.truncated = true;
        }
        self.bytes.extend(data);
    }

    pub fn contents(&self) -> Vec<u8> {
        self.bytes.iter().copied().collect()
    }

    /// Last `n` lines with terminal escapes removed
    ///
    /// After eviction the first line is usually torn, so it is skipped.
    pub fn tail_lines(&self, n: usize) -> Vec<String> {
        let cleaned = strip_ansi_escapes::strip(self.contents());
        let text = String::from_utf8_lossy(&cleaned);

        let skip_torn = usize::from(self.truncated);
        let lines: Vec<&str> = text.lines().skip(skip_torn).collect();
        lines[lines.len().saturating_sub(n)..]
            .iter()
            .map(|l| l.trim_end().to_string())
            .collect()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.truncated = false;
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
