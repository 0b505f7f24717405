//! Mission state enumeration and the status snapshot published to the
//! management collaborator.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Phase of the search-and-treat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MissionState {
    #[default]
    Idle,
    Searching,
    Aligning,
    Computing,
    Compensating,
    Extending,
    Lowering,
    Treating,
    Raising,
    Retracting,
    Resetting,
}

impl MissionState {
    /// `true` while the arm may be away from home.
    pub fn arm_deployed(&self) -> bool {
        matches!(
            self,
            MissionState::Extending
                | MissionState::Lowering
                | MissionState::Treating
                | MissionState::Raising
                | MissionState::Retracting
        )
    }
}

impl fmt::Display for MissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MissionState::Idle => "idle",
            MissionState::Searching => "searching",
            MissionState::Aligning => "aligning",
            MissionState::Computing => "computing",
            MissionState::Compensating => "compensating",
            MissionState::Extending => "extending",
            MissionState::Lowering => "lowering",
            MissionState::Treating => "treating",
            MissionState::Raising => "raising",
            MissionState::Retracting => "retracting",
            MissionState::Resetting => "resetting",
        };
        f.write_str(name)
    }
}

/// Read-only snapshot of the mission, owned and published by the state
/// machine.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MissionStatus {
    pub state: MissionState,
    /// Targets that completed a full treatment cycle.
    pub treated: u32,
    /// Distinct tracked objects that were not targets.
    pub avoided: u32,
    /// Targets dropped by the skip policy.
    pub skipped: u32,
    /// Arbiter interventions.
    pub obstacle_events: u32,
    /// Estimated distance driven, from commanded travel times.
    pub distance_cm: f32,
    /// Identity currently being serviced.
    pub current_target: Option<u64>,
    pub last_error: Option<String>,
}
