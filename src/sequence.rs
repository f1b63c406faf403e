use std::sync::atomic::{AtomicU64, Ordering};

/// Per-session source of call sequence numbers, shared by every handle of a client.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Reserves the next sequence number. Values are unique and strictly increasing.
    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// The value the next call to [`SequenceCounter::allocate`] will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

/// A response whose sequence does not belong to the call awaiting completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("response sequence {received} does not match expected {expected:?}")]
pub struct SequenceMismatch {
    pub expected: Option<u64>,
    pub received: u64,
}

/// Accepts a response only if it carries exactly the expected sequence number.
pub fn validate(expected: u64, received: u64) -> Result<(), SequenceMismatch> {
    if expected == received {
        Ok(())
    } else {
        Err(SequenceMismatch {
            expected: Some(expected),
            received,
        })
    }
}
