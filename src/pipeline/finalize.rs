//! Finalize, the last of the seven stages: no further expansion, only the
//! derived-field pass that computes dependency edges across siblings
//! before the hierarchy is handed to the writer.

use crate::hierarchy::{DependencyKind, Hierarchy, Level, SiblingDependency};

/// Levels whose siblings are treated as sequential units of work rather
/// than organizational groupings, and so get a chained "blocks" edge in
/// their committed order. Higher levels (Initiative, Feature, Epic,
/// Story) group work rather than schedule it, so no edge is inferred
/// for them.
const SEQUENCED_LEVELS: &[Level] = &[Level::Task, Level::Subtask];

/// For every parent, walk its children in their already-committed order
/// (priority desc, then insertion order, the same ordering the pipeline
/// guarantees at merge time) and emit a `Blocks` edge from each sibling
/// to the next one at a [`SEQUENCED_LEVELS`] level.
pub fn compute_sibling_dependencies(hierarchy: &Hierarchy) -> Vec<SiblingDependency> {
    let mut dependencies = Vec::new();

    for level in SEQUENCED_LEVELS.iter().copied() {
        for parent in hierarchy.nodes_at(level.parent_level().expect("sequenced levels always have a parent")) {
            let siblings = hierarchy.children_of(&parent.local_id);
            let mut ordered: Vec<&str> = siblings
                .iter()
                .map(String::as_str)
                .filter(|id| hierarchy.get(id).map(|n| n.level) == Some(level))
                .collect();
            // children_of already reflects merge-time insertion order; the
            // only remaining ordering key is priority, stable-sorted on
            // top of it so equal-priority siblings keep their insertion
            // order.
            ordered.sort_by_key(|id| {
                std::cmp::Reverse(
                    hierarchy
                        .get(id)
                        .and_then(|n| n.priority)
                        .map(priority_rank)
                        .unwrap_or(0),
                )
            });

            for pair in ordered.windows(2) {
                dependencies.push(SiblingDependency {
                    from_local_id: pair[0].to_string(),
                    to_local_id: pair[1].to_string(),
                    kind: DependencyKind::Blocks,
                });
            }
        }
    }

    dependencies
}

fn priority_rank(priority: crate::hierarchy::Priority) -> u8 {
    use crate::hierarchy::Priority;
    match priority {
        Priority::Critical => 3,
        Priority::High => 2,
        Priority::Medium => 1,
        Priority::Low => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{Estimate, EstimateUnit, Node, Priority, Provenance};
    use rustc_hash::FxHashMap;

    fn node(local_id: &str, level: Level, parent: &str, priority: Priority) -> Node {
        Node {
            local_id: local_id.to_string(),
            level,
            parent_local_id: Some(parent.to_string()),
            title: local_id.to_string(),
            description: "d".into(),
            acceptance_criteria: vec!["ac".into()],
            estimate: Some(Estimate {
                magnitude: 1.0,
                unit: EstimateUnit::Points,
            }),
            priority: Some(priority),
            labels: vec![],
            extra: FxHashMap::default(),
            confidence: 0.9,
            provenance: Provenance::default(),
        }
    }

    #[test]
    fn chains_sequenced_siblings_highest_priority_first() {
        let mut h = Hierarchy::new();
        h.insert(Node {
            local_id: "idea".into(),
            level: Level::Idea,
            parent_local_id: None,
            title: "idea".into(),
            description: "d".into(),
            acceptance_criteria: vec![],
            estimate: None,
            priority: None,
            labels: vec![],
            extra: FxHashMap::default(),
            confidence: 1.0,
            provenance: Provenance::default(),
        })
        .unwrap();
        h.insert(node("story", Level::Story, "idea", Priority::Medium))
            .unwrap();
        h.insert(node("t1", Level::Task, "story", Priority::Low)).unwrap();
        h.insert(node("t2", Level::Task, "story", Priority::Critical))
            .unwrap();
        h.insert(node("t3", Level::Task, "story", Priority::High))
            .unwrap();

        let deps = compute_sibling_dependencies(&h);
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].from_local_id, "t2");
        assert_eq!(deps[0].to_local_id, "t3");
        assert_eq!(deps[1].from_local_id, "t3");
        assert_eq!(deps[1].to_local_id, "t1");
        assert!(deps.iter().all(|d| d.kind == DependencyKind::Blocks));
    }

    #[test]
    fn no_dependencies_for_a_single_child() {
        let mut h = Hierarchy::new();
        h.insert(Node {
            local_id: "idea".into(),
            level: Level::Idea,
            parent_local_id: None,
            title: "idea".into(),
            description: "d".into(),
            acceptance_criteria: vec![],
            estimate: None,
            priority: None,
            labels: vec![],
            extra: FxHashMap::default(),
            confidence: 1.0,
            provenance: Provenance::default(),
        })
        .unwrap();
        h.insert(node("story", Level::Story, "idea", Priority::Medium))
            .unwrap();
        h.insert(node("t1", Level::Task, "story", Priority::Low)).unwrap();

        assert!(compute_sibling_dependencies(&h).is_empty());
    }
}
