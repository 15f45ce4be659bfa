//! Bounded replay buffer of task output lines.
//!
//! [`LogBuffer`] keeps the most recent lines a task produced so observers that
//! attach late can catch up. When full, the oldest line is evicted.

use std::collections::VecDeque;

/// Lines kept per task for replay.
pub const REPLAY_LINES: usize = 200;

/// Ring buffer of output lines in production order.
#[derive(Debug)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    max_lines: usize,
    /// Total lines ever pushed, including evicted ones.
    pushed: u64,
}

impl LogBuffer {
    /// Create a buffer that holds at most `max_lines` lines.
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_lines.min(256)),
            max_lines,
            pushed: 0,
        }
    }

    /// Append a line, evicting the oldest if full.
    pub fn push(&mut self, line: String) {
        if self.max_lines == 0 {
            return;
        }
        if self.lines.len() >= self.max_lines {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
        self.pushed += 1;
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.lines.iter()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Total lines ever pushed.
    pub fn pushed(&self) -> u64 {
        self.pushed
    }

    /// Number of lines no longer available for replay.
    pub fn evicted(&self) -> u64 {
        self.pushed - self.lines.len() as u64
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(REPLAY_LINES)
    }
}
