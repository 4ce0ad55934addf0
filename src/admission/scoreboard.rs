//! In-flight counters for one admission dimension.
//!
//! A scoreboard tracks how many work items are currently issued against each
//! key value of a single dimension (for example the target host). The
//! scheduler consults every configured scoreboard before issuing an item and
//! releases all of them exactly once when the item completes.

use std::collections::HashMap;

/// Per-key in-flight counters enforcing one concurrency cap.
///
/// Keys that were never issued are safe by default; an absent key (the
/// extractor could not derive one) is always safe and never consumes
/// capacity. Counts stay within `[0, limit]`; breaking that pairing is a
/// programming error and panics rather than limping along with corrupt
/// capacity accounting.
#[derive(Debug)]
pub struct Scoreboard {
    dimension: String,
    limit: usize,
    in_flight: HashMap<String, usize>,
}

impl Scoreboard {
    pub fn new(dimension: impl Into<String>, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            dimension: dimension.into(),
            limit,
            in_flight: HashMap::new(),
        }
    }

    /// Dimension name this scoreboard guards (e.g. `by-host`).
    pub fn dimension(&self) -> &str {
        &self.dimension
    }

    /// Concurrency cap applied to every key of this dimension.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Whether one more item may be issued against `key` right now.
    pub fn safe(&self, key: Option<&str>) -> bool {
        match key {
            None => true,
            Some(key) => self
                .in_flight
                .get(key)
                .map_or(true, |count| *count < self.limit),
        }
    }

    /// Consumes one capacity slot for `key`.
    ///
    /// The caller must have just observed `safe(key) == true`; issuing past
    /// the cap panics.
    pub fn issue(&mut self, key: Option<&str>) {
        let Some(key) = key else { return };
        let count = self.in_flight.entry(key.to_owned()).or_insert(0);
        assert!(
            *count < self.limit,
            "scoreboard {}: issue for {key:?} would exceed limit {}",
            self.dimension,
            self.limit,
        );
        *count += 1;
    }

    /// Releases one capacity slot for `key`.
    ///
    /// Panics if `key` has no outstanding issue; that only happens when
    /// issue/completed calls are unbalanced.
    pub fn completed(&mut self, key: Option<&str>) {
        let Some(key) = key else { return };
        match self.in_flight.get_mut(key) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    self.in_flight.remove(key);
                }
            }
            _ => panic!(
                "scoreboard {}: completed for {key:?} without a matching issue",
                self.dimension,
            ),
        }
    }

    /// Current in-flight count for `key`.
    pub fn in_flight(&self, key: &str) -> usize {
        self.in_flight.get(key).copied().unwrap_or(0)
    }

    /// Number of keys with at least one outstanding issue.
    pub fn tracked_keys(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_and_absent_keys_are_safe() {
        let board = Scoreboard::new("by-host", 2);
        assert!(board.safe(Some("a.com")));
        assert!(board.safe(None));
        assert_eq!(board.in_flight("a.com"), 0);
    }

    #[test]
    fn absent_key_is_a_no_op_for_issue_and_complete() {
        let mut board = Scoreboard::new("by-host", 1);
        board.issue(None);
        board.completed(None);
        assert_eq!(board.tracked_keys(), 0);
    }

    #[test]
    fn capacity_blocks_at_the_limit_and_reopens_after_one_completion() {
        let mut board = Scoreboard::new("by-host", 2);
        board.issue(Some("a.com"));
        assert!(board.safe(Some("a.com")));
        board.issue(Some("a.com"));
        assert!(!board.safe(Some("a.com")));
        assert!(board.safe(Some("b.com")), "keys must not interact");

        board.completed(Some("a.com"));
        assert!(board.safe(Some("a.com")));
        assert_eq!(board.in_flight("a.com"), 1);
    }

    #[test]
    fn issue_then_complete_restores_prior_state() {
        let mut board = Scoreboard::new("by-source", 3);
        board.issue(Some("42"));
        let before = board.in_flight("42");

        board.issue(Some("42"));
        board.completed(Some("42"));

        assert_eq!(board.in_flight("42"), before);
    }

    #[test]
    fn drained_keys_are_dropped() {
        let mut board = Scoreboard::new("by-source", 1);
        board.issue(Some("7"));
        board.completed(Some("7"));
        assert_eq!(board.tracked_keys(), 0);
        assert!(board.safe(Some("7")));
    }

    #[test]
    #[should_panic(expected = "without a matching issue")]
    fn unmatched_completion_panics() {
        let mut board = Scoreboard::new("by-host", 2);
        board.completed(Some("a.com"));
    }

    #[test]
    #[should_panic(expected = "would exceed limit")]
    fn issue_past_the_cap_panics() {
        let mut board = Scoreboard::new("by-host", 1);
        board.issue(Some("a.com"));
        board.issue(Some("a.com"));
    }
}
