// ABOUTME: Permit accounting for inbound flow control.
// ABOUTME: Issues a refill grant each time a batch of permits has been consumed.

use std::sync::atomic::{AtomicU64, Ordering};

/// Tracks server-granted permits consumed on an inbound stream.
///
/// The initial grant extends `permits`; every time `batch` frames have been
/// consumed since the last refill, a further grant of `batch` is due. Grants
/// are cumulative on the server side and never decrease.
#[derive(Debug)]
pub(crate) struct FlowControlGovernor {
    permits: u64,
    batch: u64,
    consumed: AtomicU64,
}

impl FlowControlGovernor {
    pub fn new(permits: u64, batch: u64) -> Self {
        Self {
            permits,
            batch,
            consumed: AtomicU64::new(0),
        }
    }

    /// The size of the initial grant.
    pub fn initial_permits(&self) -> u64 {
        self.permits
    }

    /// Account for one consumed frame.
    ///
    /// Returns the refill delta to send upstream when a full batch has been
    /// consumed, or None while the batch is still open. A batch of zero
    /// disables refills entirely.
    pub fn consume_one(&self) -> Option<u64> {
        if self.batch == 0 {
            return None;
        }
        let seen = self.consumed.fetch_add(1, Ordering::AcqRel) + 1;
        if seen >= self.batch {
            self.consumed.fetch_sub(self.batch, Ordering::AcqRel);
            Some(self.batch)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_refill_before_batch_is_exhausted() {
        let governor = FlowControlGovernor::new(10, 4);
        assert_eq!(governor.initial_permits(), 10);
        for _ in 0..3 {
            assert_eq!(governor.consume_one(), None);
        }
    }

    #[test]
    fn test_refill_after_each_batch() {
        let governor = FlowControlGovernor::new(10, 4);
        for round in 0..3 {
            for _ in 0..3 {
                assert_eq!(governor.consume_one(), None, "round {}", round);
            }
            assert_eq!(governor.consume_one(), Some(4), "round {}", round);
        }
    }

    #[test]
    fn test_zero_batch_disables_refills() {
        let governor = FlowControlGovernor::new(100, 0);
        for _ in 0..200 {
            assert_eq!(governor.consume_one(), None);
        }
    }
}
