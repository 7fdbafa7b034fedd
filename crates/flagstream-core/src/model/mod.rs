//! # Flag and Segment Data Model
//!
//! The serde representation of everything the flag delivery service
//! publishes: flags, segments, rules, clauses, rollouts, and the full-dataset
//! and stream-message payload shapes. Decoding goes through [`codec`], which
//! also runs the prepare pass that precompiles regexes, parses versions and
//! dates, and builds key sets so the evaluator never re-parses anything.

mod clause;
mod flag;
mod rollout;
mod segment;

pub mod codec;

pub use clause::{Clause, Op};
pub use flag::{ClientSideAvailability, Flag, FlagRule, Prerequisite, Target};
pub use rollout::{Rollout, RolloutKind, VariationOrRollout, WeightedVariation, TOTAL_WEIGHT};
pub use segment::{Segment, SegmentRule, SegmentTarget};

pub(crate) use clause::{parse_date, parse_semver, ClausePrep, PrepValue};
