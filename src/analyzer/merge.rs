//! Deterministic merge of candidate children produced by one or more
//! analyzers into a single deduplicated, confidence-weighted set.

use rustc_hash::FxHashMap;

use crate::config::MergeConfig;
use crate::hierarchy::{Estimate, EstimateUnit, Node, Priority, Provenance};

use super::Candidate;

/// Token-set Jaccard similarity over normalized (case-folded,
/// whitespace-collapsed, punctuation-stripped) titles.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let tokens_a = normalize_tokens(a);
    let tokens_b = normalize_tokens(b);
    if tokens_a.is_empty() && tokens_b.is_empty() {
        return 1.0;
    }
    let intersection = tokens_a.intersection(&tokens_b).count();
    let union = tokens_a.union(&tokens_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn normalize_tokens(s: &str) -> std::collections::HashSet<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Merge every analyzer's candidates for a single parent into the final
/// set of children, deduplicating near-identical titles and combining
/// fields by confidence.
///
/// `priority_order` ranks analyzer ids from most to least trusted, used
/// only to break exact confidence ties deterministically.
pub fn merge_candidates(
    candidates: Vec<Candidate>,
    config: &MergeConfig,
    priority_order: &[String],
) -> Vec<Node> {
    let mut groups: Vec<Vec<Candidate>> = Vec::new();

    'outer: for candidate in candidates {
        for group in &mut groups {
            let representative = &group[0].node.title;
            if title_similarity(representative, &candidate.node.title)
                >= config.dedup_similarity_threshold
            {
                group.push(candidate);
                continue 'outer;
            }
        }
        groups.push(vec![candidate]);
    }

    let mut merged: Vec<Node> = groups
        .into_iter()
        .map(|group| merge_group(group, config, priority_order))
        .collect();

    // Priority desc, stable so ties keep the insertion order established
    // above (first appearance among the highest-confidence analyzer's
    // candidates), matching the ordering guarantee children are committed
    // under.
    merged.sort_by_key(|node| std::cmp::Reverse(node.priority.map(|p| priority_rank(p) as i32).unwrap_or(-1)));
    merged
}

fn merge_group(
    mut group: Vec<Candidate>,
    config: &MergeConfig,
    priority_order: &[String],
) -> Node {
    // Stable analyzer-priority ordering for tie-breaking: earlier in
    // `priority_order` wins when confidences are exactly equal.
    group.sort_by_key(|c| {
        priority_order
            .iter()
            .position(|id| id == &c.analyzer_id)
            .unwrap_or(usize::MAX)
    });

    let title_conf = |c: &Candidate| field_confidence(c, "title");
    let best_title = group
        .iter()
        .max_by(|a, b| title_conf(a).total_cmp(&title_conf(b)))
        .expect("merge group is never empty");

    let desc_conf = |c: &Candidate| field_confidence(c, "description");
    let best_desc = group
        .iter()
        .max_by(|a, b| desc_conf(a).total_cmp(&desc_conf(b)))
        .expect("merge group is never empty");

    let mut acceptance_criteria: Vec<String> = group
        .iter()
        .flat_map(|c| c.node.acceptance_criteria.iter().cloned())
        .collect();
    acceptance_criteria.sort();
    acceptance_criteria.dedup();

    let mut labels: Vec<String> = group
        .iter()
        .flat_map(|c| c.node.labels.iter().cloned())
        .collect();
    labels.sort();
    labels.dedup();

    let estimate = merge_estimate(&group);
    let priority = merge_priority(&group);

    let analyzer_ids: Vec<String> = group.iter().map(|c| c.analyzer_id.clone()).collect();

    let merged_field_confidences: FxHashMap<&str, f64> = [
        ("title", title_conf(best_title)),
        ("description", desc_conf(best_desc)),
        (
            "acceptance_criteria",
            group
                .iter()
                .map(|c| field_confidence(c, "acceptance_criteria"))
                .fold(0.0, f64::max),
        ),
        (
            "labels",
            group
                .iter()
                .map(|c| field_confidence(c, "labels"))
                .fold(0.0, f64::max),
        ),
        (
            "estimate",
            group
                .iter()
                .map(|c| field_confidence(c, "estimate"))
                .fold(0.0, f64::max),
        ),
        (
            "priority",
            group
                .iter()
                .map(|c| field_confidence(c, "priority"))
                .fold(0.0, f64::max),
        ),
    ]
    .into_iter()
    .collect();

    let aggregate_confidence = weighted_mean(&merged_field_confidences, &config.field_weights);

    let mut node = best_title.node.clone();
    node.title = best_title.node.title.clone();
    node.description = best_desc.node.description.clone();
    node.acceptance_criteria = acceptance_criteria;
    node.labels = labels;
    node.estimate = estimate;
    node.priority = priority;
    node.confidence = aggregate_confidence;
    node.provenance = Provenance {
        analyzer_ids,
        rework_cycles: 0,
    };
    node
}

fn field_confidence(candidate: &Candidate, field: &str) -> f64 {
    candidate
        .field_confidence
        .get(field)
        .copied()
        .unwrap_or(candidate.node.confidence)
}

fn weighted_mean(fields: &FxHashMap<&str, f64>, weights: &FxHashMap<String, f64>) -> f64 {
    let mut total_weight = 0.0;
    let mut total = 0.0;
    for (field, confidence) in fields {
        let weight = weights.get(*field).copied().unwrap_or(1.0);
        total += confidence * weight;
        total_weight += weight;
    }
    if total_weight == 0.0 {
        0.0
    } else {
        (total / total_weight).clamp(0.0, 1.0)
    }
}

fn merge_estimate(group: &[Candidate]) -> Option<Estimate> {
    let estimates: Vec<(&Candidate, Estimate)> = group
        .iter()
        .filter_map(|c| c.node.estimate.map(|e| (c, e)))
        .collect();
    if estimates.is_empty() {
        return None;
    }
    let unit = estimates[0].1.unit;
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for (candidate, estimate) in &estimates {
        if estimate.unit != unit {
            continue;
        }
        let weight = field_confidence(candidate, "estimate").max(0.01);
        weighted_sum += estimate.magnitude * weight;
        weight_total += weight;
    }
    if weight_total == 0.0 {
        return Some(estimates[0].1);
    }
    Some(Estimate {
        magnitude: round_to_unit(weighted_sum / weight_total, unit),
        unit,
    })
}

/// Story-point estimates only take values from this Fibonacci-ish scale.
pub const FIBONACCI_POINTS: [f64; 7] = [1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0];

fn round_to_unit(magnitude: f64, unit: EstimateUnit) -> f64 {
    match unit {
        EstimateUnit::Points => nearest_fibonacci(magnitude),
        EstimateUnit::Hours | EstimateUnit::Days => (magnitude * 10.0).round() / 10.0,
    }
}

fn nearest_fibonacci(magnitude: f64) -> f64 {
    FIBONACCI_POINTS
        .iter()
        .copied()
        .min_by(|a, b| (a - magnitude).abs().total_cmp(&(b - magnitude).abs()))
        .unwrap_or(1.0)
}

fn merge_priority(group: &[Candidate]) -> Option<Priority> {
    let mut ballots: FxHashMap<u8, f64> = FxHashMap::default();
    for candidate in group {
        if let Some(priority) = candidate.node.priority {
            let weight = field_confidence(candidate, "priority").max(0.01);
            *ballots.entry(priority_rank(priority)).or_insert(0.0) += weight;
        }
    }
    ballots
        .into_iter()
        // Conservative tiebreak: the lower (less urgent) rank wins ties,
        // so a split vote never silently escalates priority.
        .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(rank, _)| rank_to_priority(rank))
}

fn priority_rank(priority: Priority) -> u8 {
    match priority {
        Priority::Low => 0,
        Priority::Medium => 1,
        Priority::High => 2,
        Priority::Critical => 3,
    }
}

fn rank_to_priority(rank: u8) -> Priority {
    match rank {
        0 => Priority::Low,
        1 => Priority::Medium,
        2 => Priority::High,
        _ => Priority::Critical,
    }
}
