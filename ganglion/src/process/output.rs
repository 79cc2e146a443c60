//! Bounded capture of worker stdout/stderr

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::types::ProcessId;

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One captured line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLine {
    pub process_id: ProcessId,
    pub stream: OutputStream,
    pub seq: u64,
    pub line: String,
    pub captured_at: DateTime<Utc>,
}

/// Ring of the most recent lines. Older lines are dropped once full.
#[derive(Debug)]
pub struct OutputBuffer {
    capacity: usize,
    inner: Mutex<RingState>,
}

#[derive(Debug)]
struct RingState {
    next_seq: u64,
    dropped: u64,
    lines: VecDeque<OutputLine>,
}

impl OutputBuffer {
    /// Create a ring retaining at most `capacity` lines
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(RingState {
                next_seq: 1,
                dropped: 0,
                lines: VecDeque::with_capacity(capacity.min(1024)),
            }),
        }
    }

    /// Record a line and return the stored copy
    pub fn push(&self, process_id: &ProcessId, stream: OutputStream, line: String) -> OutputLine {
        let mut state = self.inner.lock();
        let entry = OutputLine {
            process_id: process_id.clone(),
            stream,
            seq: state.next_seq,
            line,
            captured_at: Utc::now(),
        };
        state.next_seq = state.next_seq.saturating_add(1);
        state.lines.push_back(entry.clone());
        while state.lines.len() > self.capacity {
            state.lines.pop_front();
            state.dropped += 1;
        }
        entry
    }

    /// The most recent `limit` lines, oldest first
    pub fn tail(&self, limit: usize) -> Vec<OutputLine> {
        let state = self.inner.lock();
        let start = state.lines.len().saturating_sub(limit);
        state.lines.iter().skip(start).cloned().collect()
    }

    /// Lines with a sequence number greater than `cursor`
    pub fn since(&self, cursor: u64) -> Vec<OutputLine> {
        let state = self.inner.lock();
        state
            .lines
            .iter()
            .filter(|l| l.seq > cursor)
            .cloned()
            .collect()
    }

    /// Lines evicted from the ring so far
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    /// Lines currently retained
    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    /// Whether nothing has been retained
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
