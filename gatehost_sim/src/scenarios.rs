//! Fault-injection scenarios for deterministic simulation runs.

use crate::error::SimError;
use serde::{Serialize, Serializer};

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// Clean network, replicas must match the authority
    SteadyState,

    /// 30% loss on every link, push resyncs repair the gaps
    LossyLink,

    /// Authority cut off from every replica, then healed
    SplitBrain,

    /// A replica joins after constructs already exist
    LateJoin,

    /// Mass closes on the authority, replicas follow
    CloseStorm,

    /// Entities warped through gates while animations run
    GateJump,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SteadyState,
            ScenarioId::LossyLink,
            ScenarioId::SplitBrain,
            ScenarioId::LateJoin,
            ScenarioId::CloseStorm,
            ScenarioId::GateJump,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SteadyState => "steady_state",
            ScenarioId::LossyLink => "lossy_link",
            ScenarioId::SplitBrain => "split_brain",
            ScenarioId::LateJoin => "late_join",
            ScenarioId::CloseStorm => "close_storm",
            ScenarioId::GateJump => "gate_jump",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SteadyState => {
                "Loss-free network, link queries and a config push must reach every replica"
            }
            ScenarioId::LossyLink => {
                "30% frame loss, replicas converge once the next resync gets through"
            }
            ScenarioId::SplitBrain => {
                "Authority partitioned while it closes and spawns constructs, then healed"
            }
            ScenarioId::LateJoin => {
                "Replica joins late and catches up from its own full-sync request"
            }
            ScenarioId::CloseStorm => {
                "Authority closes most constructs at once, some expire on their own"
            }
            ScenarioId::GateJump => {
                "Warps through open and closing gates alongside a timed animation"
            }
        }
    }

    /// True for scenarios that inject network faults.
    pub fn injects_faults(&self) -> bool {
        matches!(self, ScenarioId::LossyLink | ScenarioId::SplitBrain)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Serialize for ScenarioId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "steady_state" | "steadystate" | "steady" => Ok(ScenarioId::SteadyState),
            "lossy_link" | "lossylink" | "lossy" => Ok(ScenarioId::LossyLink),
            "split_brain" | "splitbrain" => Ok(ScenarioId::SplitBrain),
            "late_join" | "latejoin" => Ok(ScenarioId::LateJoin),
            "close_storm" | "closestorm" => Ok(ScenarioId::CloseStorm),
            "gate_jump" | "gatejump" => Ok(ScenarioId::GateJump),
            _ => Err(SimError::UnknownScenario(s.to_string())),
        }
    }
}
