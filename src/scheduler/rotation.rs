//! Round-robin rotation cursor.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Counter values this close to `usize::MAX` wrap back to zero.
const OVERFLOW_MARGIN: usize = 1000;

/// Process-wide pointer into the eligible-tenant list.
///
/// [`next`](Self::next) is a single atomic read-modify-write, so concurrent
/// callers against the same eligible count never receive the same index
/// until the cursor has gone all the way around.
#[derive(Debug, Default)]
pub struct RotationCursor {
    position: AtomicUsize,
}

impl RotationCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cursor starting at an arbitrary position.
    pub fn starting_at(position: usize) -> Self {
        Self {
            position: AtomicUsize::new(position),
        }
    }

    /// Returns the current slot and advances to `(slot + 1) mod eligible`.
    /// `None` when nothing is eligible; the cursor is left untouched.
    pub fn next(&self, eligible: usize) -> Option<usize> {
        if eligible == 0 {
            return None;
        }

        let previous = self
            .position
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some((normalize(current) + 1) % eligible)
            })
            .unwrap_or_else(|current| current);

        Some(normalize(previous) % eligible)
    }

    /// Rewinds to the first slot.
    pub fn reset(&self) {
        self.position.store(0, Ordering::Release);
    }

    pub fn position(&self) -> usize {
        self.position.load(Ordering::Acquire)
    }
}

fn normalize(value: usize) -> usize {
    if value >= usize::MAX - OVERFLOW_MARGIN {
        0
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn visits_slots_in_order() {
        let cursor = RotationCursor::new();
        let picks: Vec<usize> = (0..7).filter_map(|_| cursor.next(5)).collect();
        assert_eq!(picks, vec![0, 1, 2, 3, 4, 0, 1]);
    }

    #[test]
    fn empty_set_yields_nothing() {
        let cursor = RotationCursor::starting_at(3);
        assert_eq!(cursor.next(0), None);
        assert_eq!(cursor.position(), 3);
    }

    #[test]
    fn fairness_bound_holds() {
        for eligible in 1..=7usize {
            let cursor = RotationCursor::new();
            let invocations = eligible * 4 + 3;
            let mut counts = vec![0usize; eligible];
            for _ in 0..invocations {
                counts[cursor.next(eligible).unwrap()] += 1;
            }
            let floor = invocations / eligible;
            let ceil = invocations.div_ceil(eligible);
            assert!(
                counts.iter().all(|&c| c == floor || c == ceil),
                "eligible={eligible} counts={counts:?}"
            );
        }
    }

    #[test]
    fn shrinking_eligible_set_stays_in_bounds() {
        let cursor = RotationCursor::new();
        for _ in 0..4 {
            cursor.next(10);
        }
        assert_eq!(cursor.next(3), Some(1));
        assert!(cursor.position() < 3);
    }

    #[test]
    fn near_overflow_resets_to_zero() {
        let cursor = RotationCursor::starting_at(usize::MAX - 10);
        assert_eq!(cursor.next(4), Some(0));
        assert_eq!(cursor.next(4), Some(1));
    }

    #[test]
    fn concurrent_callers_get_distinct_slots() {
        let eligible = 64;
        let cursor = Arc::new(RotationCursor::new());
        let handles: Vec<_> = (0..eligible)
            .map(|_| {
                let cursor = Arc::clone(&cursor);
                std::thread::spawn(move || cursor.next(eligible).unwrap())
            })
            .collect();

        let picks: HashSet<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(picks.len(), eligible);
    }

    #[test]
    fn reset_rewinds() {
        let cursor = RotationCursor::new();
        cursor.next(5);
        cursor.next(5);
        cursor.reset();
        assert_eq!(cursor.next(5), Some(0));
    }
}
