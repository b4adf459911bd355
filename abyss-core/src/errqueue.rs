//! Process-wide queue of failures from background work (dials that fail after the call returned,
//! rejected handle lookups on the embedding surface). Records are popped once, oldest first.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::AbyssError;

/// One queued failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub error: AbyssError,
    pub context: &'static str,
}

impl ErrorRecord {
    /// Diagnostic text, e.g. `"join world: join rejected (403): world full"`.
    pub fn body(&self) -> String {
        format!("{}: {}", self.context, self.error)
    }
}

/// Cloneable handle to a shared FIFO of error records. Unbounded: records are never dropped,
/// they stay until popped.
#[derive(Clone, Default)]
pub struct ErrorQueue {
    records: Arc<Mutex<VecDeque<ErrorRecord>>>,
}

impl ErrorQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, context: &'static str, error: AbyssError) {
        tracing::debug!(context, %error, "queued background error");
        self.records
            .lock()
            .push_back(ErrorRecord { error, context });
    }

    /// Oldest record, or `None` when the queue is empty.
    pub fn pop(&self) -> Option<ErrorRecord> {
        self.records.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
