//! Deterministic hash bucketing for rollouts, experiments, and weighted
//! segment rules.

use sha1::{Digest, Sha1};
use serde_json::Value;

use crate::context::{AttributeRef, Context, ContextKind};

// The first 15 hex digits of the hash, as an integer, are divided by this to
// land in [0, 1). The exact constant is part of the cross-SDK contract:
// bucket values must agree across implementations.
const BUCKET_SCALE: f64 = 0xFFFF_FFFF_FFFF_FFF_u64 as f64;

/// What seeds the hash input.
pub(crate) enum BucketPrefix<'a> {
    /// An explicit seed shared across flags: `"<seed>."`.
    Seed(i64),
    /// The default `"<key>.<salt>."` prefix.
    KeyAndSalt(&'a str, &'a str),
}

/// The outcome of bucketing one context.
pub(crate) struct Bucket {
    /// Position in [0, 1). Zero when the bucketing attribute was missing.
    pub(crate) value: f64,
    /// Whether the context had the required kind at all. Experiments use
    /// this to exclude contexts rather than bucket them at zero silently.
    pub(crate) kind_present: bool,
    /// Whether the bucketed context was marked anonymous.
    pub(crate) anonymous: bool,
}

/// Compute the bucket for `context` of the given kind.
///
/// The bucketed value is the context key, unless `bucket_by` names another
/// attribute. Only strings and integers are bucketable; anything else (and
/// any missing attribute) produces bucket 0.
pub(crate) fn bucket_context(
    context: &Context,
    kind: &ContextKind,
    bucket_by: Option<&AttributeRef>,
    prefix: BucketPrefix<'_>,
) -> Bucket {
    let Some(single) = context.as_kind(kind) else {
        return Bucket {
            value: 0.0,
            kind_present: false,
            anonymous: false,
        };
    };
    let anonymous = single.anonymous();
    let bucketable = match bucket_by {
        None => Some(single.key().to_string()),
        Some(reference) => single.get_value(reference).and_then(|v| bucketable_string(&v)),
    };
    let value = match bucketable {
        Some(input) => bucket_value(&hash_input(prefix, &input)),
        None => 0.0,
    };
    Bucket {
        value,
        kind_present: true,
        anonymous,
    }
}

fn bucketable_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        // Only integral numbers participate; stringifying a float would not
        // be stable across platforms.
        Value::Number(n) => n.as_i64().map(|i| i.to_string()),
        _ => None,
    }
}

fn hash_input(prefix: BucketPrefix<'_>, bucketable: &str) -> String {
    match prefix {
        BucketPrefix::Seed(seed) => format!("{seed}.{bucketable}"),
        BucketPrefix::KeyAndSalt(key, salt) => format!("{key}.{salt}.{bucketable}"),
    }
}

fn bucket_value(input: &str) -> f64 {
    let digest = Sha1::digest(input.as_bytes());
    let hexed = hex::encode(digest);
    // 15 hex digits always fit in a u64.
    let numeric = u64::from_str_radix(&hexed[..15], 16).unwrap_or(0);
    numeric as f64 / BUCKET_SCALE
}
