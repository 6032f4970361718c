use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A discrete phase of workflow execution, in canonical pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Clarify,
    Plan,
    Build,
    Test,
    Review,
    Document,
}

impl Stage {
    /// Every stage in pipeline order.
    pub const ALL: [Stage; 6] = [
        Stage::Clarify,
        Stage::Plan,
        Stage::Build,
        Stage::Test,
        Stage::Review,
        Stage::Document,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clarify => "clarify",
            Self::Plan => "plan",
            Self::Build => "build",
            Self::Test => "test",
            Self::Review => "review",
            Self::Document => "document",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown stage '{0}'")]
pub struct UnknownStage(pub String);

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clarify" => Ok(Self::Clarify),
            "plan" => Ok(Self::Plan),
            "build" => Ok(Self::Build),
            "test" => Ok(Self::Test),
            "review" => Ok(Self::Review),
            "document" | "docs" | "doc" => Ok(Self::Document),
            _ => Err(UnknownStage(s.to_string())),
        }
    }
}

/// Where an instance sits in its recipe: on a named stage, or past the last
/// one.
///
/// `Terminal` is deliberately not a [`Stage`]; externally it is rendered as
/// `"ready_to_merge"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum StagePosition {
    At(Stage),
    Terminal,
}

impl StagePosition {
    pub const TERMINAL_LABEL: &'static str = "ready_to_merge";

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::At(stage) => stage.as_str(),
            Self::Terminal => Self::TERMINAL_LABEL,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::At(stage) => Some(*stage),
            Self::Terminal => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal)
    }
}

impl fmt::Display for StagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Stage> for StagePosition {
    fn from(stage: Stage) -> Self {
        Self::At(stage)
    }
}

impl From<StagePosition> for String {
    fn from(pos: StagePosition) -> Self {
        pos.as_str().to_string()
    }
}

impl FromStr for StagePosition {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ready_to_merge" | "ready-to-merge" | "terminal" => Ok(Self::Terminal),
            other => other.parse().map(Self::At),
        }
    }
}

impl TryFrom<String> for StagePosition {
    type Error = UnknownStage;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_roundtrip() {
        for stage in Stage::ALL {
            let parsed: Stage = stage.as_str().parse().unwrap();
            assert_eq!(parsed, stage);
        }
        assert!("deploy".parse::<Stage>().is_err());
    }

    #[test]
    fn test_stage_order_matches_pipeline() {
        let mut sorted = Stage::ALL;
        sorted.sort();
        assert_eq!(sorted, Stage::ALL);
        assert!(Stage::Plan < Stage::Build);
    }

    #[test]
    fn test_terminal_serializes_as_ready_to_merge() {
        let json = serde_json::to_string(&StagePosition::Terminal).unwrap();
        assert_eq!(json, "\"ready_to_merge\"");
        let json = serde_json::to_string(&StagePosition::At(Stage::Build)).unwrap();
        assert_eq!(json, "\"build\"");
    }

    #[test]
    fn test_position_deserialize_rejects_unknown() {
        let pos: StagePosition = serde_json::from_str("\"ready_to_merge\"").unwrap();
        assert!(pos.is_terminal());
        assert!(serde_json::from_str::<StagePosition>("\"deploy\"").is_err());
    }

    #[test]
    fn test_docs_alias() {
        assert_eq!("docs".parse::<Stage>().unwrap(), Stage::Document);
    }
}
