use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, Result};

/// Lifecycle of a lane coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneStatus {
    /// Allocated, process not yet started.
    Initializing,
    /// Process running and consuming work.
    Active,
    /// Process holding state without consuming work.
    Paused,
    /// Taken out of service for operator work.
    Maintenance,
    /// Process failed; the record stays for diagnosis.
    Error,
    /// Terminal.
    Shutdown,
}

impl LaneStatus {
    /// Lowercase label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Maintenance => "maintenance",
            Self::Error => "error",
            Self::Shutdown => "shutdown",
        }
    }

    /// Whether the lane still owns a running process.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Active | Self::Paused | Self::Maintenance)
    }
}

/// Inputs to the lane state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneTransition {
    /// Supervised process started.
    Started,
    /// Stop consuming work.
    Pause,
    /// Consume work again.
    Resume,
    /// Take the lane out of service.
    EnterMaintenance,
    /// Return the lane to service.
    ExitMaintenance,
    /// Process failure.
    Fail,
    /// Permanent stop.
    Shutdown,
}

impl LaneTransition {
    /// Lowercase label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::EnterMaintenance => "enter_maintenance",
            Self::ExitMaintenance => "exit_maintenance",
            Self::Fail => "fail",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Pure lane transition table.
///
/// `shutdown` is terminal. A lane in `error` may only be shut down; a new
/// coordinator takes over its dimension afterwards.
pub fn transition(current: LaneStatus, event: LaneTransition) -> Result<LaneStatus> {
    use LaneStatus as S;
    use LaneTransition as T;
    match (current, event) {
        (S::Initializing, T::Started)
        | (S::Paused, T::Resume)
        | (S::Maintenance, T::ExitMaintenance) => Ok(S::Active),
        (S::Active, T::Pause) => Ok(S::Paused),
        (S::Active | S::Paused, T::EnterMaintenance) => Ok(S::Maintenance),
        (S::Initializing | S::Active | S::Paused | S::Maintenance, T::Fail) => Ok(S::Error),
        (S::Active | S::Paused | S::Maintenance | S::Error, T::Shutdown) => Ok(S::Shutdown),
        _ => Err(CoordinationError::InvalidTransition {
            entity: "lane",
            from: current.label(),
            event: event.label(),
        }),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    use LaneStatus as S;
    use LaneTransition as T;

    #[test]
    fn pause_resume_cycle() {
        let paused = transition(S::Active, T::Pause).unwrap();
        assert_eq!(paused, S::Paused);
        assert_eq!(transition(paused, T::Resume).unwrap(), S::Active);
        assert!(transition(S::Active, T::Resume).is_err());
        assert!(transition(S::Paused, T::Pause).is_err());
    }

    #[test]
    fn maintenance_returns_to_active() {
        for from in [S::Active, S::Paused] {
            let maintenance = transition(from, T::EnterMaintenance).unwrap();
            assert_eq!(transition(maintenance, T::ExitMaintenance).unwrap(), S::Active);
        }
        assert!(transition(S::Initializing, T::EnterMaintenance).is_err());
    }

    #[test]
    fn shutdown_is_terminal() {
        for from in [S::Active, S::Paused, S::Maintenance, S::Error] {
            assert_eq!(transition(from, T::Shutdown).unwrap(), S::Shutdown);
        }
        for event in [
            T::Started,
            T::Pause,
            T::Resume,
            T::EnterMaintenance,
            T::ExitMaintenance,
            T::Fail,
            T::Shutdown,
        ] {
            let err = transition(S::Shutdown, event).unwrap_err();
            assert!(matches!(err, CoordinationError::InvalidTransition { entity: "lane", .. }));
        }
    }

    #[test]
    fn initializing_cannot_shut_down() {
        assert!(transition(S::Initializing, T::Shutdown).is_err());
        assert_eq!(transition(S::Initializing, T::Fail).unwrap(), S::Error);
    }
}
