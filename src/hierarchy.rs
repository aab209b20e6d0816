//! The uniform hierarchy data model and the structural invariants every
//! [`Hierarchy`] must uphold: level monotonicity, parent existence,
//! confidence bounds, and acyclicity.
//!
//! The level ladder, node shape, and forest structure are intentionally
//! data-only: nothing in this module calls an analyzer or a tracker. That
//! keeps `Hierarchy` trivially testable and safe to hand across task
//! boundaries without synchronization.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The seven rungs of the decomposition ladder, in strictly descending
/// order. `encode`/`decode` give a stable string form for logging and the
/// external event stream, mirroring how node kinds are round-tripped
/// elsewhere in this codebase's lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Idea,
    Initiative,
    Feature,
    Epic,
    Story,
    Task,
    Subtask,
}

impl Level {
    pub const ALL: [Level; 7] = [
        Level::Idea,
        Level::Initiative,
        Level::Feature,
        Level::Epic,
        Level::Story,
        Level::Task,
        Level::Subtask,
    ];

    /// The level immediately below this one, or `None` for `Subtask`.
    pub fn child(self) -> Option<Level> {
        let idx = Self::ALL.iter().position(|l| *l == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    /// The level immediately above this one, or `None` for `Idea`.
    pub fn parent_level(self) -> Option<Level> {
        let idx = Self::ALL.iter().position(|l| *l == self)?;
        idx.checked_sub(1).map(|i| Self::ALL[i])
    }

    pub fn encode(self) -> &'static str {
        match self {
            Level::Idea => "idea",
            Level::Initiative => "initiative",
            Level::Feature => "feature",
            Level::Epic => "epic",
            Level::Story => "story",
            Level::Task => "task",
            Level::Subtask => "subtask",
        }
    }

    pub fn decode(s: &str) -> Option<Level> {
        Self::ALL.iter().copied().find(|l| l.encode() == s)
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.encode())
    }
}

/// Relative sizing priority assigned by the gate/analyzers; kept as an
/// explicit small enum rather than a free integer so invalid priorities
/// are unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// Where a merged field's value ultimately came from, kept for audit and
/// for the learning-signal event stream.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Provenance {
    pub analyzer_ids: Vec<String>,
    pub rework_cycles: u32,
}

/// The uniform element of the hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub local_id: String,
    pub level: Level,
    pub parent_local_id: Option<String>,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub estimate: Option<Estimate>,
    pub priority: Option<Priority>,
    pub labels: Vec<String>,
    #[serde(default)]
    pub extra: FxHashMap<String, Value>,
    pub confidence: f64,
    pub provenance: Provenance,
}

impl Node {
    pub fn is_root(&self) -> bool {
        self.parent_local_id.is_none() && self.level == Level::Idea
    }
}

/// Effort estimate in a single configured unit (points, hours, or days);
/// the unit is carried alongside the magnitude so downstream consumers
/// never have to guess.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Estimate {
    pub magnitude: f64,
    pub unit: EstimateUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateUnit {
    Points,
    Hours,
    Days,
}

/// A forest rooted at exactly one `Idea` node, stored as a flat map keyed
/// by local id so lookups during merge/gate/write stay O(1) without
/// requiring a tree-shaped borrow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hierarchy {
    nodes: FxHashMap<String, Node>,
    children: FxHashMap<String, Vec<String>>,
    root_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum HierarchyError {
    #[error("duplicate local id: {0}")]
    DuplicateLocalId(String),
    #[error("parent `{parent}` does not exist for node `{child}`")]
    MissingParent { parent: String, child: String },
    #[error("node `{0}` is not a descendant of level {1}")]
    LevelOutOfOrder(String, Level),
    #[error("hierarchy already has a root")]
    RootAlreadySet,
    #[error("confidence {0} for node `{1}` is outside [0, 1]")]
    ConfidenceOutOfBounds(f64, String),
}

impl Hierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node, enforcing that local ids are unique, a parent
    /// exists before its child is inserted, the level strictly increases
    /// from parent to child, and confidence stays within `0.0..=1.0`.
    pub fn insert(&mut self, node: Node) -> Result<(), HierarchyError> {
        if !(0.0..=1.0).contains(&node.confidence) {
            return Err(HierarchyError::ConfidenceOutOfBounds(
                node.confidence,
                node.local_id,
            ));
        }
        if self.nodes.contains_key(&node.local_id) {
            return Err(HierarchyError::DuplicateLocalId(node.local_id));
        }

        match &node.parent_local_id {
            None => {
                if node.level != Level::Idea {
                    return Err(HierarchyError::LevelOutOfOrder(node.local_id, node.level));
                }
                if self.root_id.is_some() {
                    return Err(HierarchyError::RootAlreadySet);
                }
                self.root_id = Some(node.local_id.clone());
            }
            Some(parent_id) => {
                let parent = self
                    .nodes
                    .get(parent_id)
                    .ok_or_else(|| HierarchyError::MissingParent {
                        parent: parent_id.clone(),
                        child: node.local_id.clone(),
                    })?;
                if parent.level.child() != Some(node.level) {
                    return Err(HierarchyError::LevelOutOfOrder(node.local_id, node.level));
                }
                self.children
                    .entry(parent_id.clone())
                    .or_default()
                    .push(node.local_id.clone());
            }
        }

        self.nodes.insert(node.local_id.clone(), node);
        Ok(())
    }

    pub fn get(&self, local_id: &str) -> Option<&Node> {
        self.nodes.get(local_id)
    }

    pub fn children_of(&self, local_id: &str) -> &[String] {
        self.children.get(local_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn root(&self) -> Option<&Node> {
        self.root_id.as_deref().and_then(|id| self.nodes.get(id))
    }

    pub fn nodes_at(&self, level: Level) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(move |n| n.level == level)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Topological write order: parents strictly before children, stable
    /// within a level by insertion order of `local_id`. This is what the
    /// tracker writer iterates over.
    pub fn topological_order(&self) -> Vec<&Node> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<&str> = self.root_id.iter().map(String::as_str).collect();
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(id) {
                out.push(node);
            }
            if let Some(children) = self.children.get(id) {
                for child in children.iter().rev() {
                    stack.push(child.as_str());
                }
            }
        }
        out
    }
}

/// A dependency between two sibling nodes, computed during the S₇
/// Finalize stage (no expansion, just annotation) and identified by local id rather
/// than index so it survives being handed across the Pipeline/Writer
/// boundary independent of any particular `Vec` ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiblingDependency {
    pub from_local_id: String,
    pub to_local_id: String,
    pub kind: DependencyKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// `from` blocks `to`: `to` should not start before `from` completes.
    Blocks,
}
