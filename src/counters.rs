//! Message counters shared by every partition claim

use parking_lot::Mutex;

/// Point-in-time view of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Messages processed without error
    pub consumed: u64,
    /// Messages whose processing returned an error
    pub errors: u64,
}

impl CounterSnapshot {
    pub fn total(&self) -> u64 {
        self.consumed + self.errors
    }
}

/// Success/error counters updated concurrently from claim tasks
///
/// Both values sit behind one lock so every read is a consistent pair.
#[derive(Debug, Default)]
pub struct MessageCounters {
    inner: Mutex<CounterSnapshot>,
}

impl MessageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a successfully processed message, returning the updated values
    pub fn record_success(&self) -> CounterSnapshot {
        let mut counters = self.inner.lock();
        counters.consumed += 1;
        *counters
    }

    /// Count a failed message, returning the updated values
    pub fn record_error(&self) -> CounterSnapshot {
        let mut counters = self.inner.lock();
        counters.errors += 1;
        *counters
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        *self.inner.lock()
    }
}
