//! # Evaluation Engine
//!
//! Pure flag evaluation: a function of (flag, context, dataset snapshot,
//! big-segment query) producing a value, a variation index, and a
//! machine-readable [`Reason`]. The engine performs no I/O beyond looking up
//! referenced flags and segments through [`DataProvider`] and, for unbounded
//! segments, one membership query per distinct context key through
//! [`BigSegmentResolver`].

mod bucketing;
mod evaluator;
mod operators;

pub use evaluator::{Evaluator, PrerequisiteEvent, PrerequisiteEventRecorder};

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Flag, Segment};

/// Why an evaluation returned the caller's default value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The SDK has not yet received a full dataset.
    ClientNotReady,
    /// No flag with the requested key exists in the dataset.
    FlagNotFound,
    /// The context was invalid (empty key).
    UserNotSpecified,
    /// The flag data is self-contradictory: an out-of-range variation
    /// index, an empty rollout, or a prerequisite/segment cycle.
    MalformedFlag,
    /// The value did not have the type the caller requested.
    WrongType,
    /// The evaluation panicked; the panic was contained.
    Exception,
}

/// Health of the big-segment store as observed during an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BigSegmentsStatus {
    /// The store was queried and its data is current.
    Healthy,
    /// The store was queried but has not been synchronized recently.
    Stale,
    /// The store query failed.
    StoreError,
    /// A big segment was referenced but no store is configured.
    NotConfigured,
}

impl BigSegmentsStatus {
    // Higher loses: when one evaluation touches several big segments the
    // reported status is the most severe observed.
    fn severity(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Stale => 1,
            Self::NotConfigured => 2,
            Self::StoreError => 3,
        }
    }

    pub(crate) fn worst(a: Self, b: Self) -> Self {
        if b.severity() > a.severity() {
            b
        } else {
            a
        }
    }
}

/// The per-kind cause of an evaluation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ReasonKind {
    /// The flag was off; the off variation (if any) applied.
    #[serde(rename = "OFF")]
    Off,
    /// No target or rule matched.
    #[serde(rename = "FALLTHROUGH", rename_all = "camelCase")]
    Fallthrough {
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    /// The context key was in one of the flag's target lists.
    #[serde(rename = "TARGET_MATCH")]
    TargetMatch,
    /// A rule matched.
    #[serde(rename = "RULE_MATCH", rename_all = "camelCase")]
    RuleMatch {
        rule_index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_id: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    /// A prerequisite flag did not serve the required variation.
    #[serde(rename = "PREREQUISITE_FAILED", rename_all = "camelCase")]
    PrerequisiteFailed { prerequisite_key: String },
    /// The evaluation failed; the default value was returned.
    #[serde(rename = "ERROR", rename_all = "camelCase")]
    Error { error_kind: ErrorKind },
}

/// Structured explanation of why a value was returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reason {
    #[serde(flatten)]
    pub kind: ReasonKind,
    /// Present when the evaluation consulted big segments.
    #[serde(
        rename = "bigSegmentsStatus",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub big_segments_status: Option<BigSegmentsStatus>,
}

impl Reason {
    pub fn off() -> Self {
        ReasonKind::Off.into()
    }

    pub fn fallthrough(in_experiment: bool) -> Self {
        ReasonKind::Fallthrough { in_experiment }.into()
    }

    pub fn target_match() -> Self {
        ReasonKind::TargetMatch.into()
    }

    pub fn error(error_kind: ErrorKind) -> Self {
        ReasonKind::Error { error_kind }.into()
    }

    /// Whether this reason reports experiment traffic.
    pub fn is_in_experiment(&self) -> bool {
        matches!(
            self.kind,
            ReasonKind::Fallthrough {
                in_experiment: true
            } | ReasonKind::RuleMatch {
                in_experiment: true,
                ..
            }
        )
    }
}

impl From<ReasonKind> for Reason {
    fn from(kind: ReasonKind) -> Self {
        Self {
            kind,
            big_segments_status: None,
        }
    }
}

/// The result of one evaluation: the value (absent when the flag served no
/// variation and the caller's default applies), the variation index, and the
/// reason.
#[derive(Debug, Clone, PartialEq)]
pub struct Detail {
    pub value: Option<Value>,
    pub variation_index: Option<usize>,
    pub reason: Reason,
}

impl Detail {
    /// An error result; the caller substitutes its default value.
    pub fn error(error_kind: ErrorKind) -> Self {
        Self {
            value: None,
            variation_index: None,
            reason: Reason::error(error_kind),
        }
    }
}

/// Read access to the dataset snapshot an evaluation runs against.
pub trait DataProvider {
    /// Look up a flag by key; tombstones resolve to `None`.
    fn flag(&self, key: &str) -> Option<Arc<Flag>>;
    /// Look up a segment by key; tombstones resolve to `None`.
    fn segment(&self, key: &str) -> Option<Arc<Segment>>;
}

/// One big-segment membership answer.
#[derive(Debug, Clone)]
pub struct BigSegmentsQuery {
    /// Segment-reference → included/excluded. `None` when the store had no
    /// record for the context (or the query failed, per `status`).
    pub membership: Option<HashMap<String, bool>>,
    pub status: BigSegmentsStatus,
}

/// Membership lookup for unbounded segments, keyed by the raw context key of
/// the segment's context kind. Implementations hash and cache.
pub trait BigSegmentResolver: Send + Sync {
    fn query(&self, context_key: &str) -> BigSegmentsQuery;
}
