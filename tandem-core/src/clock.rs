//! Lamport clock shared by every container of a [`Document`](crate::Document).

use serde::{Deserialize, Serialize};

/// Monotonic logical counter.
///
/// Local operations are stamped with [`tick`](LamportClock::tick); every
/// remote-stamped operation is folded in with [`merge`](LamportClock::merge)
/// before it is applied, so the next local stamp is causally after it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LamportClock {
    value: u64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock and return the new value.
    pub fn tick(&mut self) -> u64 {
        self.value += 1;
        self.value
    }

    /// Fold in a remote clock value: `value = max(value, remote) + 1`.
    pub fn merge(&mut self, remote: u64) {
        self.value = self.value.max(remote) + 1;
    }

    pub fn value(&self) -> u64 {
        self.value
    }
}
