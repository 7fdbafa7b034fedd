//! The flag evaluation algorithm.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::bucketing::{bucket_context, Bucket, BucketPrefix};
use super::operators;
use super::{
    BigSegmentResolver, BigSegmentsStatus, DataProvider, Detail, ErrorKind, Reason, ReasonKind,
};
use crate::context::{AttributeRef, Context, ContextKind};
use crate::model::{
    Clause, Flag, FlagRule, Op, Rollout, Segment, SegmentRule, VariationOrRollout, TOTAL_WEIGHT,
};

/// A prerequisite evaluation performed as part of evaluating another flag.
/// Recorded so the event pipeline can report prerequisite usage.
#[derive(Debug, Clone)]
pub struct PrerequisiteEvent {
    /// The flag whose prerequisites were being checked.
    pub target_flag_key: String,
    /// The prerequisite flag that was evaluated.
    pub prerequisite_flag: Arc<Flag>,
    /// The prerequisite's own evaluation result.
    pub prerequisite_result: Detail,
    pub context: Context,
}

/// Receives prerequisite evaluations as they happen.
pub trait PrerequisiteEventRecorder {
    fn record(&self, event: PrerequisiteEvent);
}

/// The evaluation engine. Holds only borrowed collaborators; construction is
/// free, so callers build one per evaluation or share one per snapshot as
/// they prefer.
pub struct Evaluator<'a> {
    provider: &'a dyn DataProvider,
    big_segments: Option<&'a dyn BigSegmentResolver>,
}

/// Per-evaluation bookkeeping: cycle guards, the big-segment status observed
/// so far, and one cached membership query per context key.
#[derive(Default)]
struct EvalState {
    prerequisite_chain: Vec<String>,
    segment_chain: Vec<String>,
    big_segments_status: Option<BigSegmentsStatus>,
    memberships: HashMap<String, Option<HashMap<String, bool>>>,
}

impl EvalState {
    fn note_status(&mut self, status: BigSegmentsStatus) {
        self.big_segments_status = Some(match self.big_segments_status {
            Some(current) => BigSegmentsStatus::worst(current, status),
            None => status,
        });
    }
}

type EvalResult<T> = Result<T, ErrorKind>;

impl<'a> Evaluator<'a> {
    pub fn new(provider: &'a dyn DataProvider) -> Self {
        Self {
            provider,
            big_segments: None,
        }
    }

    /// Attach a big-segment resolver for `unbounded` segment lookups.
    pub fn with_big_segments(mut self, resolver: &'a dyn BigSegmentResolver) -> Self {
        self.big_segments = Some(resolver);
        self
    }

    /// Evaluate `flag` against `context`.
    ///
    /// Never fails: malformed data, cycles, and invalid contexts come back
    /// as error reasons with no value, and the caller substitutes its
    /// default.
    pub fn evaluate(
        &self,
        flag: &Flag,
        context: &Context,
        recorder: Option<&dyn PrerequisiteEventRecorder>,
    ) -> Detail {
        if !context.has_valid_keys() {
            return Detail::error(ErrorKind::UserNotSpecified);
        }
        let mut state = EvalState::default();
        let mut detail = match self.eval_flag(flag, context, &mut state, recorder) {
            Ok(detail) => detail,
            Err(error_kind) => {
                tracing::warn!(flag_key = %flag.key, ?error_kind, "flag evaluation failed");
                Detail::error(error_kind)
            }
        };
        if let Some(status) = state.big_segments_status {
            detail.reason.big_segments_status = Some(status);
        }
        detail
    }

    fn eval_flag(
        &self,
        flag: &Flag,
        context: &Context,
        state: &mut EvalState,
        recorder: Option<&dyn PrerequisiteEventRecorder>,
    ) -> EvalResult<Detail> {
        if !flag.on {
            return self.off_result(flag, ReasonKind::Off);
        }

        if let Some(failed_key) = self.failed_prerequisite(flag, context, state, recorder)? {
            return self.off_result(
                flag,
                ReasonKind::PrerequisiteFailed {
                    prerequisite_key: failed_key,
                },
            );
        }

        if let Some(variation) = flag.target_match(context) {
            return self.variation_result(flag, variation, ReasonKind::TargetMatch);
        }

        for (rule_index, rule) in flag.rules.iter().enumerate() {
            if self.rule_matches(rule, context, state)? {
                let (variation, in_experiment) =
                    self.resolve(flag, &rule.variation_or_rollout, context)?;
                return self.variation_result(
                    flag,
                    variation,
                    ReasonKind::RuleMatch {
                        rule_index,
                        rule_id: rule.id.clone(),
                        in_experiment,
                    },
                );
            }
        }

        let (variation, in_experiment) = self.resolve(flag, &flag.fallthrough, context)?;
        self.variation_result(flag, variation, ReasonKind::Fallthrough { in_experiment })
    }

    /// Walk the prerequisites in declaration order; the first failure wins.
    /// Every prerequisite evaluation is reported to the recorder whether it
    /// passed or not.
    fn failed_prerequisite(
        &self,
        flag: &Flag,
        context: &Context,
        state: &mut EvalState,
        recorder: Option<&dyn PrerequisiteEventRecorder>,
    ) -> EvalResult<Option<String>> {
        if flag.prerequisites.is_empty() {
            return Ok(None);
        }
        if state.prerequisite_chain.iter().any(|key| *key == flag.key) {
            tracing::error!(
                flag_key = %flag.key,
                "prerequisite cycle detected; flag data is malformed"
            );
            return Err(ErrorKind::MalformedFlag);
        }
        state.prerequisite_chain.push(flag.key.clone());
        let outcome = self.walk_prerequisites(flag, context, state, recorder);
        state.prerequisite_chain.pop();
        outcome
    }

    fn walk_prerequisites(
        &self,
        flag: &Flag,
        context: &Context,
        state: &mut EvalState,
        recorder: Option<&dyn PrerequisiteEventRecorder>,
    ) -> EvalResult<Option<String>> {
        for prerequisite in &flag.prerequisites {
            let Some(prerequisite_flag) = self.provider.flag(&prerequisite.key) else {
                return Ok(Some(prerequisite.key.clone()));
            };
            let detail = self.eval_flag(&prerequisite_flag, context, state, recorder)?;
            let passed = prerequisite_flag.on
                && detail.variation_index == Some(prerequisite.variation);
            if let Some(recorder) = recorder {
                recorder.record(PrerequisiteEvent {
                    target_flag_key: flag.key.clone(),
                    prerequisite_flag: Arc::clone(&prerequisite_flag),
                    prerequisite_result: detail,
                    context: context.clone(),
                });
            }
            if !passed {
                return Ok(Some(prerequisite.key.clone()));
            }
        }
        Ok(None)
    }

    fn rule_matches(
        &self,
        rule: &FlagRule,
        context: &Context,
        state: &mut EvalState,
    ) -> EvalResult<bool> {
        for clause in &rule.clauses {
            if !self.clause_matches(clause, context, state)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn clause_matches(
        &self,
        clause: &Clause,
        context: &Context,
        state: &mut EvalState,
    ) -> EvalResult<bool> {
        if clause.op == Op::SegmentMatch {
            let matched = self.any_segment_matches(clause, context, state)?;
            return Ok(matched != clause.negate);
        }

        let reference = clause.attribute_ref();
        if !reference.is_valid() {
            return Ok(false);
        }

        // A clause on the `kind` attribute tests every kind the context has,
        // not one component's attributes.
        if reference.depth() == 1 && reference.components()[0] == "kind" {
            let matched = context.kinds().iter().any(|kind| {
                self.clause_value_match(clause, &Value::String(kind.as_str().to_string()))
            });
            return Ok(matched != clause.negate);
        }

        let Some(single) = context.as_kind(&clause.kind()) else {
            // Missing kind: no match, and negation does not flip that.
            return Ok(false);
        };
        let Some(value) = single.get_value(&reference) else {
            return Ok(false);
        };
        if value.is_null() {
            return Ok(false);
        }

        let matched = match &value {
            Value::Array(items) => items.iter().any(|item| self.clause_value_match(clause, item)),
            other => self.clause_value_match(clause, other),
        };
        Ok(matched != clause.negate)
    }

    fn clause_value_match(&self, clause: &Clause, context_value: &Value) -> bool {
        if let Some(prep) = clause.prep() {
            // Multi-value `in` over strings is a set lookup.
            if let (Op::In, Some(set)) = (clause.op, prep.in_set.as_ref()) {
                return context_value.as_str().is_some_and(|s| set.contains(s));
            }
            return clause
                .values
                .iter()
                .zip(&prep.values)
                .any(|(value, prep_value)| {
                    operators::apply(clause.op, context_value, value, Some(prep_value))
                });
        }
        clause
            .values
            .iter()
            .any(|value| operators::apply(clause.op, context_value, value, None))
    }

    fn any_segment_matches(
        &self,
        clause: &Clause,
        context: &Context,
        state: &mut EvalState,
    ) -> EvalResult<bool> {
        for value in &clause.values {
            let Some(key) = value.as_str() else { continue };
            let Some(segment) = self.provider.segment(key) else {
                continue;
            };
            if self.segment_matches(&segment, context, state)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn segment_matches(
        &self,
        segment: &Segment,
        context: &Context,
        state: &mut EvalState,
    ) -> EvalResult<bool> {
        if state.segment_chain.iter().any(|key| *key == segment.key) {
            tracing::error!(
                segment_key = %segment.key,
                "segment cycle detected; segment data is malformed"
            );
            return Err(ErrorKind::MalformedFlag);
        }

        if segment.unbounded {
            return self.unbounded_segment_matches(segment, context, state);
        }

        let user_kind = ContextKind::user();
        if let Some(user) = context.as_kind(&user_kind) {
            if segment.excluded_contains(user.key()) {
                return Ok(false);
            }
        }
        for target in &segment.excluded_contexts {
            if let Some(single) = context.as_kind(&target.kind()) {
                if target.contains(single.key()) {
                    return Ok(false);
                }
            }
        }
        if let Some(user) = context.as_kind(&user_kind) {
            if segment.included_contains(user.key()) {
                return Ok(true);
            }
        }
        for target in &segment.included_contexts {
            if let Some(single) = context.as_kind(&target.kind()) {
                if target.contains(single.key()) {
                    return Ok(true);
                }
            }
        }

        state.segment_chain.push(segment.key.clone());
        let outcome = self.segment_rules_match(segment, context, state);
        state.segment_chain.pop();
        outcome
    }

    fn segment_rules_match(
        &self,
        segment: &Segment,
        context: &Context,
        state: &mut EvalState,
    ) -> EvalResult<bool> {
        'rules: for rule in &segment.rules {
            for clause in &rule.clauses {
                if !self.clause_matches(clause, context, state)? {
                    continue 'rules;
                }
            }
            if self.segment_rule_weight_passes(segment, rule, context) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn segment_rule_weight_passes(
        &self,
        segment: &Segment,
        rule: &SegmentRule,
        context: &Context,
    ) -> bool {
        let Some(weight) = rule.weight else {
            return true;
        };
        let kind = rule.rollout_context_kind.clone().unwrap_or_default();
        let bucket_by = rule.bucket_by.as_ref().map(|attribute| {
            if rule.rollout_context_kind.is_some() {
                AttributeRef::new(attribute.clone())
            } else {
                AttributeRef::literal(attribute.clone())
            }
        });
        let bucket = bucket_context(
            context,
            &kind,
            bucket_by.as_ref(),
            BucketPrefix::KeyAndSalt(&segment.key, &segment.salt),
        );
        bucket.value < weight as f64 / TOTAL_WEIGHT as f64
    }

    fn unbounded_segment_matches(
        &self,
        segment: &Segment,
        context: &Context,
        state: &mut EvalState,
    ) -> EvalResult<bool> {
        let Some(resolver) = self.big_segments else {
            state.note_status(BigSegmentsStatus::NotConfigured);
            return Ok(false);
        };
        if segment.generation.is_none() {
            // Membership can only be resolved against a known generation.
            state.note_status(BigSegmentsStatus::NotConfigured);
            return Ok(false);
        }
        let Some(single) = context.as_kind(&segment.unbounded_kind()) else {
            return Ok(false);
        };
        let context_key = single.key().to_string();
        if !state.memberships.contains_key(&context_key) {
            let query = resolver.query(&context_key);
            state.note_status(query.status);
            state.memberships.insert(context_key.clone(), query.membership);
        }
        let membership = state.memberships.get(&context_key).and_then(|m| m.as_ref());
        match membership.and_then(|m| m.get(&segment.reference())) {
            Some(true) => Ok(true),
            Some(false) => Ok(false),
            // No explicit inclusion or exclusion: the segment's own rules
            // still apply.
            None => {
                state.segment_chain.push(segment.key.clone());
                let outcome = self.segment_rules_match(segment, context, state);
                state.segment_chain.pop();
                outcome
            }
        }
    }

    fn resolve(
        &self,
        flag: &Flag,
        variation_or_rollout: &VariationOrRollout,
        context: &Context,
    ) -> EvalResult<(usize, bool)> {
        if let Some(variation) = variation_or_rollout.variation {
            return Ok((variation, false));
        }
        let Some(rollout) = &variation_or_rollout.rollout else {
            return Err(ErrorKind::MalformedFlag);
        };
        self.resolve_rollout(flag, rollout, context)
    }

    fn resolve_rollout(
        &self,
        flag: &Flag,
        rollout: &Rollout,
        context: &Context,
    ) -> EvalResult<(usize, bool)> {
        if rollout.variations.is_empty() {
            return Err(ErrorKind::MalformedFlag);
        }
        let kind = rollout.resolved_context_kind();
        let is_experiment = rollout.is_experiment();
        // Experiments always bucket by key so assignments stay stable even
        // if a bucketing attribute changes.
        let bucket_by = if is_experiment {
            None
        } else {
            rollout.bucket_by.as_ref().map(|attribute| {
                if rollout.context_kind.is_some() {
                    AttributeRef::new(attribute.clone())
                } else {
                    AttributeRef::literal(attribute.clone())
                }
            })
        };
        let prefix = match rollout.seed {
            Some(seed) => BucketPrefix::Seed(seed),
            None => BucketPrefix::KeyAndSalt(&flag.key, &flag.salt),
        };
        let Bucket {
            value: bucket,
            kind_present,
            anonymous,
        } = bucket_context(context, &kind, bucket_by.as_ref(), prefix);

        let mut cumulative = 0.0;
        let mut selected = None;
        for weighted in &rollout.variations {
            cumulative += weighted.weight as f64 / TOTAL_WEIGHT as f64;
            if bucket < cumulative {
                selected = Some(weighted);
                break;
            }
        }
        // Rounding drift, or weights summing short of the total: the last
        // bucket absorbs it.
        let weighted = match selected.or(rollout.variations.last()) {
            Some(weighted) => weighted,
            None => return Err(ErrorKind::MalformedFlag),
        };
        let in_experiment = is_experiment && kind_present && !anonymous && !weighted.untracked;
        Ok((weighted.variation, in_experiment))
    }

    fn variation_result(
        &self,
        flag: &Flag,
        variation: usize,
        reason: ReasonKind,
    ) -> EvalResult<Detail> {
        let Some(value) = flag.variation_value(variation) else {
            return Err(ErrorKind::MalformedFlag);
        };
        Ok(Detail {
            value: Some(value.clone()),
            variation_index: Some(variation),
            reason: reason.into(),
        })
    }

    fn off_result(&self, flag: &Flag, reason: ReasonKind) -> EvalResult<Detail> {
        match flag.off_variation {
            Some(variation) => self.variation_result(flag, variation, reason),
            None => Ok(Detail {
                value: None,
                variation_index: None,
                reason: reason.into(),
            }),
        }
    }
}
