//! Phase/status escalation rules
//!
//! Phase ids are ordered temporally and status ids by severity, so an
//! update must satisfy two post-conditions: while healthy, the pair only
//! moves forward (never regress); once failed, the earliest failure point
//! is preserved, with a failure in an earlier phase allowed to pull the
//! recorded phase backwards. Escalation applies the same rule at every
//! level of the xml -> download -> action chain, and because an update
//! that is not strictly better is ignored, concurrent escalations
//! converge to the same pair regardless of ordering.

/// A stored or proposed (phase, status) pair, by enumeration id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseStatus {
    pub phase: i64,
    pub status: i64,
}

impl PhaseStatus {
    pub fn new(phase: i64, status: i64) -> Self {
        Self { phase, status }
    }
}

/// What an update is allowed to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Not strictly better; leave the row alone.
    Ignore,
    /// An earlier failure wins the phase; the status stays failed.
    PhaseOnly,
    /// Same phase, more severe status.
    StatusOnly,
    /// Advance, or record the first failure.
    Both,
}

/// Decide what a proposed pair may overwrite, given the failed status id.
pub fn resolve(current: PhaseStatus, proposed: PhaseStatus, failed: i64) -> Outcome {
    let already_failed = current.status == failed;
    let new_failure = proposed.status == failed;

    if already_failed {
        if new_failure && proposed.phase < current.phase {
            Outcome::PhaseOnly
        } else {
            Outcome::Ignore
        }
    } else if new_failure {
        Outcome::Both
    } else if proposed.phase < current.phase {
        Outcome::Ignore
    } else if proposed.phase == current.phase {
        if proposed.status > current.status {
            Outcome::StatusOnly
        } else {
            Outcome::Ignore
        }
    } else {
        Outcome::Both
    }
}

/// Apply an outcome, yielding the pair that should be stored.
pub fn apply(current: PhaseStatus, proposed: PhaseStatus, outcome: Outcome) -> PhaseStatus {
    match outcome {
        Outcome::Ignore => current,
        Outcome::PhaseOnly => PhaseStatus::new(proposed.phase, current.status),
        Outcome::StatusOnly => PhaseStatus::new(current.phase, proposed.status),
        Outcome::Both => proposed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAILED: i64 = 5;
    const DONE: i64 = 3;
    const RUNNING: i64 = 2;
    const PENDING: i64 = 1;

    fn step(current: PhaseStatus, proposed: PhaseStatus) -> PhaseStatus {
        apply(current, proposed, resolve(current, proposed, FAILED))
    }

    #[test]
    fn healthy_updates_never_regress_phase() {
        let current = PhaseStatus::new(6, DONE);
        let proposed = PhaseStatus::new(4, DONE);
        assert_eq!(resolve(current, proposed, FAILED), Outcome::Ignore);
    }

    #[test]
    fn healthy_same_phase_advances_status_only() {
        let current = PhaseStatus::new(4, RUNNING);
        let proposed = PhaseStatus::new(4, DONE);
        assert_eq!(resolve(current, proposed, FAILED), Outcome::StatusOnly);
        assert_eq!(step(current, proposed), PhaseStatus::new(4, DONE));
    }

    #[test]
    fn healthy_same_phase_lower_status_ignored() {
        let current = PhaseStatus::new(4, DONE);
        let proposed = PhaseStatus::new(4, RUNNING);
        assert_eq!(resolve(current, proposed, FAILED), Outcome::Ignore);
    }

    #[test]
    fn healthy_later_phase_replaces_both() {
        let current = PhaseStatus::new(4, DONE);
        let proposed = PhaseStatus::new(6, RUNNING);
        assert_eq!(resolve(current, proposed, FAILED), Outcome::Both);
    }

    #[test]
    fn first_failure_is_recorded() {
        let current = PhaseStatus::new(6, DONE);
        let proposed = PhaseStatus::new(6, FAILED);
        assert_eq!(resolve(current, proposed, FAILED), Outcome::Both);
    }

    #[test]
    fn earlier_failure_wins_phase_keeps_failed_status() {
        let current = PhaseStatus::new(8, FAILED);
        let proposed = PhaseStatus::new(6, FAILED);
        assert_eq!(resolve(current, proposed, FAILED), Outcome::PhaseOnly);
        assert_eq!(step(current, proposed), PhaseStatus::new(6, FAILED));
    }

    #[test]
    fn later_failure_does_not_override_earlier() {
        let current = PhaseStatus::new(6, FAILED);
        let proposed = PhaseStatus::new(8, FAILED);
        assert_eq!(resolve(current, proposed, FAILED), Outcome::Ignore);
    }

    #[test]
    fn recovery_does_not_clear_failure() {
        let current = PhaseStatus::new(6, FAILED);
        let proposed = PhaseStatus::new(7, DONE);
        assert_eq!(resolve(current, proposed, FAILED), Outcome::Ignore);
    }

    #[test]
    fn escalation_is_idempotent() {
        let pairs = [
            PhaseStatus::new(4, PENDING),
            PhaseStatus::new(4, RUNNING),
            PhaseStatus::new(4, DONE),
            PhaseStatus::new(4, FAILED),
            PhaseStatus::new(6, DONE),
            PhaseStatus::new(6, FAILED),
            PhaseStatus::new(8, RUNNING),
        ];
        for current in pairs {
            for proposed in pairs {
                let once = step(current, proposed);
                let twice = step(once, proposed);
                assert_eq!(once, twice, "current {current:?} proposed {proposed:?}");
            }
        }
    }

    #[test]
    fn concurrent_escalations_converge() {
        // The order in which two descendants report must not matter.
        let start = PhaseStatus::new(4, DONE);
        let a = PhaseStatus::new(6, FAILED);
        let b = PhaseStatus::new(8, FAILED);
        let ab = step(step(start, a), b);
        let ba = step(step(start, b), a);
        assert_eq!(ab, ba);
        assert_eq!(ab, PhaseStatus::new(6, FAILED));
    }
}
