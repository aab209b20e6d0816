//! The immutable input to a run.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form product idea plus the optional structured context analyzers
/// may use to ground their expansions (team profile, budget/timeline
/// hints, prior art). Nothing about an `Idea` changes once a run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Idea {
    pub description: String,
    #[serde(default)]
    pub context: FxHashMap<String, Value>,
    #[serde(default)]
    pub team_profile: Option<TeamProfile>,
    #[serde(default)]
    pub budget_hint: Option<String>,
    #[serde(default)]
    pub timeline_hint: Option<String>,
}

impl Idea {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            context: FxHashMap::default(),
            team_profile: None,
            budget_hint: None,
            timeline_hint: None,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: FxHashMap<String, Value>) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn with_team_profile(mut self, profile: TeamProfile) -> Self {
        self.team_profile = Some(profile);
        self
    }
}

/// Coarse description of the team that will execute the resulting plan,
/// used by analyzers to calibrate estimates and acceptance criteria.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamProfile {
    pub size: u32,
    #[serde(default)]
    pub seniority: Option<Seniority>,
    /// Free-form technology tags (e.g. "rust", "postgres", "react").
    #[serde(default)]
    pub tech_tags: Vec<String>,
    #[serde(default)]
    pub velocity_points_per_sprint: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Seniority {
    Junior,
    Mixed,
    Senior,
}
