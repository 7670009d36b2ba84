use std::collections::VecDeque;

/// A storage request submitted by this worker whose reply has not been
/// collected yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingSums {
    Alloc { bytes: u64 },
    Get { units: usize },
}

/// Per-connection scratch state.
///
/// NOTE: No synchronization needed - this state is owned by a single connection.
#[derive(Debug, Default)]
pub struct ConnectionState {
    /// Submitted storage requests, oldest first. Replies arrive in the same
    /// order because the outbox is FIFO per tag.
    pending: VecDeque<PendingSums>,
    /// Statements run, for the disconnect log line.
    pub statements: u64,
    pub failed_statements: u64,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a submitted request and returns the number now pending.
    pub fn submitted(&mut self, request: PendingSums) -> usize {
        self.pending.push_back(request);
        self.pending.len()
    }

    /// The request the next reply answers.
    pub fn oldest(&self) -> Option<PendingSums> {
        self.pending.front().copied()
    }

    /// Marks the oldest request as answered.
    pub fn answered(&mut self) -> Option<PendingSums> {
        self.pending.pop_front()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Forgets every pending request; used once the queue is closed.
    pub fn abandon(&mut self) -> usize {
        let abandoned = self.pending.len();
        self.pending.clear();
        abandoned
    }
}
