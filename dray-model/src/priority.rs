//! Queue sort keys and the failure-driven priority decay.
//!
//! A queue entry's sort key folds the operator-assigned priority digit
//! and the job's creation instant into one real number; lower keys
//! dequeue first. Keys only ever grow (decay) while an entry keeps
//! failing with permission-like errors, so healthy hosts overtake it.

/// Number of consecutive failures after which decay switches from the
/// fixed ten-minute step to the creation-time proportional step.
pub const RETRY_THRESHOLD: u32 = 5;

/// Decay steps applied beyond this ceiling would lose precision and
/// could reorder the queue, so entries saturate here.
pub fn max_threshold(now: i64) -> f64 {
    now as f64 * 10_000.0 * 20.0
}

/// Sort key for a push job.
pub fn msg_number(
    priority: u8,
    creation_time: i64,
    unique_number: u16,
    split_counter: u32,
) -> f64 {
    f64::from(priority - b'0')
        * (creation_time as f64 * 10_000.0
            + f64::from(unique_number)
            + f64::from(split_counter))
}

/// Sort key for a pull job. The directory's `queued` flag guarantees at
/// most one pull per directory, so no uniqueness term is needed.
pub fn retrieve_msg_number(priority: u8, now: i64) -> f64 {
    f64::from(priority - b'0') * (now as f64 * 10_000.0)
}

/// Grow `key` after a decay-class failure.
///
/// The first [`RETRY_THRESHOLD`] failures push the entry back by a
/// fixed 6e7 (about ten minutes of key space); after that the step is
/// proportional to the creation time and the retry count. Keys at or
/// beyond the ceiling are left alone, and a step may never carry the
/// key past it.
pub fn decay(key: f64, creation_time: i64, retries: u32, ceiling: f64) -> f64 {
    if key >= ceiling {
        return key;
    }
    let stepped = if retries < RETRY_THRESHOLD {
        key + 60_000_000.0
    } else {
        key + creation_time as f64
            * 10_000.0
            * (retries as f64 - f64::from(RETRY_THRESHOLD) - 1.0)
    };
    stepped.min(ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_key_matches_hand_computation() {
        // priority '5', creation 1000, unique 7, split 0
        assert_eq!(msg_number(b'5', 1000, 7, 0), 50_000_035.0);
    }

    #[test]
    fn lower_priority_digit_sorts_first() {
        let urgent = msg_number(b'1', 1000, 0, 0);
        let lazy = msg_number(b'9', 1000, 0, 0);
        assert!(urgent < lazy);
    }

    #[test]
    fn later_creation_sorts_after() {
        assert!(msg_number(b'5', 1000, 0, 0) < msg_number(b'5', 1001, 0, 0));
    }

    #[test]
    fn early_decay_steps_are_fixed() {
        let key = msg_number(b'5', 1000, 7, 0);
        let ceiling = max_threshold(2_000_000_000);
        assert_eq!(decay(key, 1000, 1, ceiling), key + 60_000_000.0);
        assert_eq!(decay(key, 1000, 4, ceiling), key + 60_000_000.0);
    }

    #[test]
    fn late_decay_steps_grow_with_retries() {
        let key = 1.0e12;
        let creation = 1_600_000_000i64;
        let ceiling = max_threshold(1_700_000_000);
        // retries - threshold - 1: 0 at 6, 1 at 7, ...
        assert_eq!(decay(key, creation, 6, ceiling), key);
        assert_eq!(
            decay(key, creation, 7, ceiling),
            key + creation as f64 * 10_000.0
        );
    }

    #[test]
    fn decay_saturates_at_ceiling() {
        let ceiling = max_threshold(1_700_000_000);
        // At the ceiling: untouched.
        assert_eq!(decay(ceiling, 1_600_000_000, 2, ceiling), ceiling);
        // A step that would cross it: clamped.
        let just_below = ceiling - 1.0;
        assert_eq!(decay(just_below, 1_600_000_000, 2, ceiling), ceiling);
        // And never wraps below.
        assert!(decay(ceiling + 1.0e9, 1_600_000_000, 9, ceiling) >= ceiling);
    }
}
