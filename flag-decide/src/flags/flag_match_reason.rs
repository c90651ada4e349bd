use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureFlagMatchReason {
    ConditionMatch,
    NoConditionMatch,
    OutOfRolloutBound,
    NoGroupType,
}

impl FeatureFlagMatchReason {
    /// Higher scores are closer to a match; used to report the most informative miss.
    pub fn score(&self) -> i32 {
        match self {
            FeatureFlagMatchReason::ConditionMatch => 3,
            FeatureFlagMatchReason::NoGroupType => 2,
            FeatureFlagMatchReason::OutOfRolloutBound => 1,
            FeatureFlagMatchReason::NoConditionMatch => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureFlagMatchReason::ConditionMatch => "condition_match",
            FeatureFlagMatchReason::NoConditionMatch => "no_condition_match",
            FeatureFlagMatchReason::OutOfRolloutBound => "out_of_rollout_bound",
            FeatureFlagMatchReason::NoGroupType => "no_group_type",
        }
    }
}

impl PartialOrd for FeatureFlagMatchReason {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FeatureFlagMatchReason {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score().cmp(&other.score())
    }
}

impl std::fmt::Display for FeatureFlagMatchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
