//! Recipe parsing and recipe-scoped stage advancement.
//!
//! There is no global "after X comes Y" table anywhere in the crate: the
//! successor of a stage is always looked up inside the instance's own recipe,
//! so an instance can never be pushed into a stage its recipe does not list.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::models::{Stage, StagePosition};
use crate::errors::{WorkflowError, WorkflowResult};

/// Ordered, duplicate-free subset of the pipeline stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    name: String,
    stages: Vec<Stage>,
}

const SDLC: [Stage; 5] = [
    Stage::Plan,
    Stage::Build,
    Stage::Test,
    Stage::Review,
    Stage::Document,
];

impl Recipe {
    /// Parse a recipe identifier such as `plan_build_test`, `adw_plan_build_iso`,
    /// `sdlc` or `plan+build`.
    pub fn parse(identifier: &str) -> WorkflowResult<Self> {
        let normalized = identifier.trim().to_ascii_lowercase();
        let body = normalized.strip_prefix("adw_").unwrap_or(&normalized);
        let body = body.strip_suffix("_iso").unwrap_or(body);

        let mut stages: Vec<Stage> = Vec::new();
        for token in body
            .split(|c: char| matches!(c, '_' | '-' | '+' | ',') || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            let expanded: Vec<Stage> = match token {
                "sdlc" => SDLC.to_vec(),
                "full" => Stage::ALL.to_vec(),
                other => vec![other.parse::<Stage>().map_err(|_| {
                    WorkflowError::validation(
                        None,
                        format!("recipe '{}' names unknown stage '{}'", identifier, other),
                    )
                })?],
            };
            for stage in expanded {
                if stages.contains(&stage) {
                    return Err(WorkflowError::validation(
                        None,
                        format!("recipe '{}' lists stage '{}' twice", identifier, stage),
                    ));
                }
                if let Some(last) = stages.last()
                    && *last > stage
                {
                    return Err(WorkflowError::validation(
                        None,
                        format!(
                            "recipe '{}' puts '{}' after '{}', out of pipeline order",
                            identifier, stage, last
                        ),
                    ));
                }
                stages.push(stage);
            }
        }

        if stages.is_empty() {
            return Err(WorkflowError::validation(
                None,
                format!("recipe '{}' contains no stages", identifier),
            ));
        }

        Ok(Self {
            name: identifier.trim().to_string(),
            stages,
        })
    }

    /// Rebuild a recipe from a persisted stage list.
    pub fn from_stages(name: &str, stages: Vec<Stage>) -> WorkflowResult<Self> {
        if stages.is_empty() {
            return Err(WorkflowError::validation(
                None,
                format!("recipe '{}' contains no stages", name),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            stages,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn first(&self) -> Stage {
        // Construction guarantees at least one stage.
        self.stages[0]
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    pub fn position(&self, stage: Stage) -> Option<usize> {
        self.stages.iter().position(|s| *s == stage)
    }

    /// Starting position for a brand-new (or restarted) instance.
    pub fn initial_position(&self) -> StagePosition {
        StagePosition::At(self.first())
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.stages.iter().map(Stage::as_str).collect();
        write!(f, "{} [{}]", self.name, names.join(" → "))
    }
}

/// Successor of `current` within `recipe`, or `Terminal` after its last stage.
///
/// A stage the recipe does not contain is a validation error, never an
/// implicit advance.
pub fn next_stage(recipe: &Recipe, current: Stage) -> WorkflowResult<StagePosition> {
    let index = recipe.position(current).ok_or_else(|| {
        WorkflowError::validation(
            None,
            format!("stage '{}' is not part of recipe {}", current, recipe),
        )
    })?;
    Ok(match recipe.stages.get(index + 1) {
        Some(next) => StagePosition::At(*next),
        None => StagePosition::Terminal,
    })
}

/// Apply a completion signal to a stored position. Completing from `Terminal`
/// or from a stage other than the current one is rejected.
pub fn advance(
    recipe: &Recipe,
    position: StagePosition,
    completed: Stage,
) -> WorkflowResult<StagePosition> {
    match position {
        StagePosition::Terminal => Err(WorkflowError::validation(
            None,
            format!(
                "cannot complete stage '{}': recipe {} is already finished",
                completed, recipe
            ),
        )),
        StagePosition::At(current) if current != completed => Err(WorkflowError::validation(
            None,
            format!(
                "completion for stage '{}' does not match current stage '{}'",
                completed, current
            ),
        )),
        StagePosition::At(current) => next_stage(recipe, current),
    }
}
