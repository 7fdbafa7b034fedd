//! # Evaluation Contexts
//!
//! A [`Context`] describes the subject of a flag evaluation: a user, a
//! device, an organization, or any other kind of entity. Contexts are either
//! *single* (one kind, one key, optional attributes) or *multi* (a set of
//! single contexts with distinct kinds). They are immutable once built;
//! construction goes through [`ContextBuilder`] or [`MultiContextBuilder`].

mod attribute_ref;
mod builder;

pub use attribute_ref::AttributeRef;
pub use builder::{ContextBuilder, MultiContextBuilder};

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde_json::Value;

/// The reserved kind name used by multi-contexts.
pub const MULTI_KIND: &str = "multi";

const DEFAULT_KIND: &str = "user";

/// A context kind: a lowercase identifier classifying what a context
/// represents. Defaults to `user`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextKind(String);

impl ContextKind {
    /// The default `user` kind.
    pub fn user() -> Self {
        Self(DEFAULT_KIND.to_string())
    }

    /// Whether this is the default `user` kind.
    pub fn is_user(&self) -> bool {
        self.0 == DEFAULT_KIND
    }

    /// Whether this is the reserved `multi` kind.
    pub fn is_multi(&self) -> bool {
        self.0 == MULTI_KIND
    }

    /// The kind name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validates a kind name: nonempty, `[-._a-zA-Z0-9]` only, and not the
    /// reserved word `kind`. `multi` is valid only for multi-contexts and is
    /// rejected here.
    pub(crate) fn validate(name: &str) -> Result<(), ContextError> {
        if name.is_empty() {
            return Err(ContextError::InvalidKind {
                kind: name.to_string(),
            });
        }
        if name == "kind" || name == MULTI_KIND {
            return Err(ContextError::InvalidKind {
                kind: name.to_string(),
            });
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
        {
            return Err(ContextError::InvalidKind {
                kind: name.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn multi() -> Self {
        Self(MULTI_KIND.to_string())
    }

    pub(crate) fn new_unchecked(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl Default for ContextKind {
    fn default() -> Self {
        Self::user()
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextKind {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// Flag and segment JSON name kinds freely; validation happens only when
// contexts are built, so deserialization accepts any string here. A kind
// that could never be built simply never matches anything.
impl serde::Serialize for ContextKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ContextKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self(<String as serde::Deserialize>::deserialize(deserializer)?))
    }
}

/// Errors reported while building a context.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContextError {
    /// The kind name is empty, reserved, or contains invalid characters.
    #[error("invalid context kind {kind:?}")]
    InvalidKind {
        /// The rejected kind name
        kind: String,
    },

    /// A multi-context contained two contexts of the same kind.
    #[error("duplicate context kind {kind:?} in multi-context")]
    DuplicateKind {
        /// The duplicated kind name
        kind: String,
    },

    /// A multi-context was built with no contexts.
    #[error("multi-context must contain at least one context")]
    EmptyMultiContext,

    /// A multi-context was given another multi-context as a component.
    #[error("multi-context components must be single contexts")]
    NestedMultiContext,
}

/// The subject of a flag evaluation.
///
/// A context with an empty key can be built (so that callers do not have to
/// handle construction errors at every call site), but every evaluation
/// against it fails with the `USER_NOT_SPECIFIED` error reason.
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    kind: ContextKind,
    key: String,
    name: Option<String>,
    anonymous: bool,
    attributes: HashMap<String, Value>,
    private_attributes: Vec<AttributeRef>,
    // Some(..) exactly when this is a multi-context; keyed and therefore
    // ordered by kind.
    components: Option<BTreeMap<ContextKind, Context>>,
}

impl Context {
    /// Start building a single context of the default `user` kind.
    pub fn builder(key: impl Into<String>) -> ContextBuilder {
        ContextBuilder::new(key)
    }

    /// Start building a multi-context.
    pub fn multi_builder() -> MultiContextBuilder {
        MultiContextBuilder::new()
    }

    pub(crate) fn new_single(
        kind: ContextKind,
        key: String,
        name: Option<String>,
        anonymous: bool,
        attributes: HashMap<String, Value>,
        private_attributes: Vec<AttributeRef>,
    ) -> Self {
        Self {
            kind,
            key,
            name,
            anonymous,
            attributes,
            private_attributes,
            components: None,
        }
    }

    pub(crate) fn new_multi(components: BTreeMap<ContextKind, Context>) -> Self {
        let key = components
            .values()
            .map(|c| format!("{}:{}", c.kind, encode_key_component(&c.key)))
            .collect::<Vec<_>>()
            .join(":");
        Self {
            kind: ContextKind::multi(),
            key,
            name: None,
            anonymous: false,
            attributes: HashMap::new(),
            private_attributes: Vec::new(),
            components: Some(components),
        }
    }

    /// Whether this is a multi-context.
    pub fn is_multi(&self) -> bool {
        self.components.is_some()
    }

    /// The context kind (`multi` for multi-contexts).
    pub fn kind(&self) -> &ContextKind {
        &self.kind
    }

    /// The context key. For multi-contexts this is the canonical combined
    /// key, equal to [`Context::fully_qualified_key`].
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The optional name attribute.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether the context is marked anonymous.
    pub fn anonymous(&self) -> bool {
        self.anonymous
    }

    /// Private attribute references attached to this context.
    pub fn private_attributes(&self) -> &[AttributeRef] {
        &self.private_attributes
    }

    /// Custom (non-built-in) attributes.
    pub fn custom_attributes(&self) -> &HashMap<String, Value> {
        &self.attributes
    }

    /// All kinds present: the single kind, or every component kind.
    pub fn kinds(&self) -> Vec<&ContextKind> {
        match &self.components {
            Some(components) => components.keys().collect(),
            None => vec![&self.kind],
        }
    }

    /// The single context of the given kind, if present.
    ///
    /// For a single context this returns `self` when the kind matches; for a
    /// multi-context it selects the matching component.
    pub fn as_kind(&self, kind: &ContextKind) -> Option<&Context> {
        match &self.components {
            Some(components) => components.get(kind),
            None => (self.kind == *kind).then_some(self),
        }
    }

    /// Component contexts of a multi-context, or a one-element slice view of
    /// a single context expressed through an iterator.
    pub fn individual_contexts(&self) -> Vec<&Context> {
        match &self.components {
            Some(components) => components.values().collect(),
            None => vec![self],
        }
    }

    /// True when every contained context has a nonempty key.
    pub fn has_valid_keys(&self) -> bool {
        self.individual_contexts().iter().all(|c| !c.key.is_empty())
    }

    /// The canonical key used for secure-mode hashing and context
    /// deduplication: the plain key for a single `user` context, otherwise
    /// `kind:key` pairs (escaped) joined in kind order.
    pub fn fully_qualified_key(&self) -> String {
        match &self.components {
            Some(_) => self.key.clone(),
            None if self.kind.is_user() => self.key.clone(),
            None => format!("{}:{}", self.kind, encode_key_component(&self.key)),
        }
    }

    /// Resolve an attribute reference against this (single) context.
    ///
    /// Built-in attributes `key`, `kind`, `name`, and `anonymous` are only
    /// addressable as single-component references. Multi-contexts expose only
    /// `kind`.
    pub fn get_value(&self, reference: &AttributeRef) -> Option<Value> {
        if !reference.is_valid() {
            return None;
        }
        let components = reference.components();
        let first = components[0].as_str();

        if self.is_multi() {
            return (components.len() == 1 && first == "kind")
                .then(|| Value::String(self.kind.to_string()));
        }

        if components.len() == 1 {
            match first {
                "key" => return Some(Value::String(self.key.clone())),
                "kind" => return Some(Value::String(self.kind.to_string())),
                "name" => return self.name.clone().map(Value::String),
                "anonymous" => return Some(Value::Bool(self.anonymous)),
                _ => {}
            }
        }

        let mut current = self.attributes.get(first)?;
        for component in &components[1..] {
            current = current.as_object()?.get(component)?;
        }
        Some(current.clone())
    }
}

/// Escapes `%` and `:` in a key so that fully-qualified keys are unambiguous.
fn encode_key_component(key: &str) -> String {
    key.replace('%', "%25").replace(':', "%3A")
}
