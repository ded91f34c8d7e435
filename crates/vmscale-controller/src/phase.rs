//! Controller phases.

use std::fmt;

/// Phases of a controller run, in order. A run only ever moves forward;
/// horizontal runs skip `WarmingUp`, and a failed or aborted run jumps
/// straight to `Draining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControllerPhase {
    Provisioning,
    WarmingUp,
    Testing,
    Draining,
    Terminated,
}

impl ControllerPhase {
    /// Whether moving to `next` keeps the run monotonic.
    pub fn can_advance_to(self, next: ControllerPhase) -> bool {
        next > self
    }
}

impl fmt::Display for ControllerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControllerPhase::Provisioning => "provisioning",
            ControllerPhase::WarmingUp => "warming-up",
            ControllerPhase::Testing => "testing",
            ControllerPhase::Draining => "draining",
            ControllerPhase::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_only_move_forward() {
        use ControllerPhase::*;
        assert!(Provisioning.can_advance_to(WarmingUp));
        assert!(Provisioning.can_advance_to(Testing));
        assert!(Testing.can_advance_to(Draining));
        assert!(!Draining.can_advance_to(Testing));
        assert!(!Testing.can_advance_to(Testing));
        assert!(!Terminated.can_advance_to(Provisioning));
    }

    #[test]
    fn display_is_kebab_case() {
        assert_eq!(ControllerPhase::WarmingUp.to_string(), "warming-up");
    }
}
