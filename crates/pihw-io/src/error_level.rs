//! Four-level hysteresis error model shared by every device
//!
//! A fault moves a device one step towards [`ErrorLevel::Critical`]; a
//! success moves it one step back towards [`ErrorLevel::Ok`]. Only a
//! catastrophic fault reaches [`ErrorLevel::Failure`], and leaving it takes
//! three consecutive successes.

use serde::{Deserialize, Serialize};

/// Severity of a device's recent transaction history
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ErrorLevel {
    #[default]
    Ok,
    Warning,
    Critical,
    Failure,
}

impl ErrorLevel {
    /// Level after one transaction outcome
    pub fn after(self, occurred: bool, catastrophic: bool) -> Self {
        match (occurred, catastrophic) {
            (true, true) => ErrorLevel::Failure,
            (true, false) => match self {
                ErrorLevel::Ok => ErrorLevel::Warning,
                ErrorLevel::Warning | ErrorLevel::Critical => ErrorLevel::Critical,
                // Non-catastrophic faults never lower a failure
                ErrorLevel::Failure => ErrorLevel::Failure,
            },
            (false, _) => match self {
                ErrorLevel::Failure => ErrorLevel::Critical,
                ErrorLevel::Critical => ErrorLevel::Warning,
                ErrorLevel::Warning | ErrorLevel::Ok => ErrorLevel::Ok,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorLevel::Ok => "ok",
            ErrorLevel::Warning => "warning",
            ErrorLevel::Critical => "critical",
            ErrorLevel::Failure => "failure",
        }
    }
}

impl std::fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Holds a level and applies outcomes to it
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorTracker {
    level: ErrorLevel,
}

impl ErrorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> ErrorLevel {
        self.level
    }

    /// Apply an outcome, returning `true` when the level changed
    pub fn handle_error(&mut self, occurred: bool, catastrophic: bool) -> bool {
        let next = self.level.after(occurred, catastrophic);
        let changed = next != self.level;
        self.level = next;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_faults_reach_critical() {
        let mut tracker = ErrorTracker::new();
        for _ in 0..3 {
            tracker.handle_error(true, false);
        }
        assert_eq!(tracker.level(), ErrorLevel::Critical);
    }

    #[test]
    fn test_catastrophic_jumps_to_failure() {
        for start in [
            ErrorLevel::Ok,
            ErrorLevel::Warning,
            ErrorLevel::Critical,
            ErrorLevel::Failure,
        ] {
            assert_eq!(start.after(true, true), ErrorLevel::Failure);
        }
    }

    #[test]
    fn test_recovery_is_gradual() {
        let mut tracker = ErrorTracker::new();
        tracker.handle_error(true, true);

        assert!(tracker.handle_error(false, false));
        assert_eq!(tracker.level(), ErrorLevel::Critical);
        tracker.handle_error(false, false);
        assert_eq!(tracker.level(), ErrorLevel::Warning);
        tracker.handle_error(false, false);
        assert_eq!(tracker.level(), ErrorLevel::Ok);
        assert!(!tracker.handle_error(false, false));
    }

    #[test]
    fn test_non_catastrophic_keeps_failure() {
        assert_eq!(ErrorLevel::Failure.after(true, false), ErrorLevel::Failure);
    }

    #[test]
    fn test_alternating_outcomes_stay_low() {
        let mut tracker = ErrorTracker::new();
        let mut seen = Vec::new();
        for i in 0..20 {
            tracker.handle_error(i % 2 == 1, false);
            seen.push(tracker.level());
        }
        assert!(seen.iter().all(|l| *l <= ErrorLevel::Warning));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn non_catastrophic_faults_never_fail(outcomes in prop::collection::vec(any::<bool>(), 0..64)) {
                let mut tracker = ErrorTracker::new();
                for occurred in outcomes {
                    tracker.handle_error(occurred, false);
                    prop_assert!(tracker.level() <= ErrorLevel::Critical);
                }
            }

            #[test]
            fn one_step_at_a_time(
                outcomes in prop::collection::vec((any::<bool>(), any::<bool>()), 0..64)
            ) {
                let mut tracker = ErrorTracker::new();
                for (occurred, catastrophic) in outcomes {
                    let before = tracker.level() as i32;
                    tracker.handle_error(occurred, catastrophic);
                    let after = tracker.level() as i32;
                    if !(occurred && catastrophic) {
                        prop_assert!((after - before).abs() <= 1);
                    }
                }
            }
        }
    }
}
