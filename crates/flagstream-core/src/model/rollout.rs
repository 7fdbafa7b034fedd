//! Percentage rollouts and experiments.

use serde::{Deserialize, Serialize};

use crate::context::ContextKind;

/// Total weight across the variations of a rollout. Weights that do not sum
/// to exactly this are tolerated: the walk is cumulative and the final
/// variation absorbs any rounding drift.
pub const TOTAL_WEIGHT: i64 = 100_000;

/// Distinguishes plain percentage rollouts from experiment traffic splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RolloutKind {
    #[default]
    Rollout,
    Experiment,
}

/// One bucket of a rollout: a variation index and its weight out of
/// [`TOTAL_WEIGHT`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedVariation {
    pub variation: usize,
    pub weight: i64,
    /// Experiment-only: a bucket whose assignments are not reported as
    /// experiment traffic.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub untracked: bool,
}

/// A deterministic hash-based split of contexts across variations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default, skip_serializing_if = "is_default_kind")]
    pub kind: RolloutKind,
    /// Which context kind is bucketed. Absent means `user`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<ContextKind>,
    /// Attribute to bucket by instead of the context key. Ignored for
    /// experiments, which always bucket by key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<String>,
    pub variations: Vec<WeightedVariation>,
    /// When present, replaces flag key and salt in the hash input so that
    /// separate flags can share bucket assignments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

fn is_default_kind(kind: &RolloutKind) -> bool {
    *kind == RolloutKind::Rollout
}

impl Rollout {
    /// Whether this rollout is an experiment.
    pub fn is_experiment(&self) -> bool {
        self.kind == RolloutKind::Experiment
    }

    /// The context kind bucketed by this rollout.
    pub fn resolved_context_kind(&self) -> ContextKind {
        self.context_kind.clone().unwrap_or_default()
    }
}

/// Either a fixed variation index or a rollout. Used by rules and by the
/// flag-level fallthrough.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariationOrRollout {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollout: Option<Rollout>,
}
