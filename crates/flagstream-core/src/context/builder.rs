//! Builders for single and multi contexts.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use super::{AttributeRef, Context, ContextError, ContextKind};

/// Builder for a single-kind [`Context`].
///
/// ```
/// use flagstream_core::context::Context;
/// use serde_json::json;
///
/// let context = Context::builder("user-42")
///     .kind("user")
///     .name("Ada")
///     .set_value("groups", json!(["beta"]))
///     .private_attribute("/email")
///     .build()
///     .unwrap();
/// assert_eq!(context.key(), "user-42");
/// ```
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    kind: String,
    key: String,
    name: Option<String>,
    anonymous: bool,
    attributes: HashMap<String, Value>,
    private_attributes: Vec<AttributeRef>,
}

impl ContextBuilder {
    pub(crate) fn new(key: impl Into<String>) -> Self {
        Self {
            kind: ContextKind::user().as_str().to_string(),
            key: key.into(),
            name: None,
            anonymous: false,
            attributes: HashMap::new(),
            private_attributes: Vec::new(),
        }
    }

    /// Set the context kind. Defaults to `user`.
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Replace the context key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Set the built-in `name` attribute.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Mark the context anonymous. Anonymous contexts are excluded from
    /// index events and experiment bucketing treats them specially.
    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    /// Set a custom attribute to an arbitrary JSON value.
    ///
    /// The built-in names `key`, `kind`, `name`, and `anonymous` are routed
    /// to their typed setters when the value has the right type, and ignored
    /// otherwise; `_meta` is always ignored.
    pub fn set_value(mut self, name: &str, value: Value) -> Self {
        match (name, &value) {
            ("key", Value::String(s)) => self.key = s.clone(),
            ("kind", Value::String(s)) => self.kind = s.clone(),
            ("name", Value::String(s)) => self.name = Some(s.clone()),
            ("anonymous", Value::Bool(b)) => self.anonymous = *b,
            ("key" | "kind" | "name" | "anonymous" | "_meta", _) => {}
            (_, Value::Null) => {
                self.attributes.remove(name);
            }
            _ => {
                self.attributes.insert(name.to_string(), value);
            }
        }
        self
    }

    /// Convenience for string attributes.
    pub fn set_string(self, name: &str, value: impl Into<String>) -> Self {
        self.set_value(name, Value::String(value.into()))
    }

    /// Mark an attribute as private for this context. Accepts either a plain
    /// name or a `/a/b` pointer.
    pub fn private_attribute(mut self, reference: impl Into<String>) -> Self {
        self.private_attributes.push(AttributeRef::new(reference.into()));
        self
    }

    /// Validate and build the context.
    ///
    /// An empty key is allowed here (evaluations against it fail with
    /// `USER_NOT_SPECIFIED`); an invalid kind is not.
    pub fn build(self) -> Result<Context, ContextError> {
        ContextKind::validate(&self.kind)?;
        Ok(Context::new_single(
            ContextKind::new_unchecked(self.kind),
            self.key,
            self.name,
            self.anonymous,
            self.attributes,
            self.private_attributes,
        ))
    }
}

/// Builder for a multi-kind [`Context`].
///
/// Building with a single component returns that component unchanged, so a
/// "multi" of one kind behaves identically to the underlying context.
#[derive(Debug, Clone, Default)]
pub struct MultiContextBuilder {
    contexts: Vec<Context>,
}

impl MultiContextBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a single context as a component.
    pub fn add(mut self, context: Context) -> Self {
        self.contexts.push(context);
        self
    }

    /// Validate and build the multi-context.
    pub fn build(self) -> Result<Context, ContextError> {
        let mut contexts = self.contexts;
        if contexts.is_empty() {
            return Err(ContextError::EmptyMultiContext);
        }
        if contexts.len() == 1 {
            if let Some(only) = contexts.pop() {
                return Ok(only);
            }
        }
        let mut components = BTreeMap::new();
        for context in contexts {
            if context.is_multi() {
                return Err(ContextError::NestedMultiContext);
            }
            let kind = context.kind().clone();
            if components.insert(kind.clone(), context).is_some() {
                return Err(ContextError::DuplicateKind {
                    kind: kind.as_str().to_string(),
                });
            }
        }
        Ok(Context::new_multi(components))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_value_routes_built_ins() {
        let context = Context::builder("ignored")
            .set_value("key", json!("real-key"))
            .set_value("name", json!("n"))
            .set_value("anonymous", json!(true))
            .set_value("_meta", json!({"x": 1}))
            .set_value("custom", json!(7))
            .build()
            .unwrap();
        assert_eq!(context.key(), "real-key");
        assert_eq!(context.name(), Some("n"));
        assert!(context.anonymous());
        assert!(!context.custom_attributes().contains_key("_meta"));
        assert_eq!(context.custom_attributes()["custom"], json!(7));
    }

    #[test]
    fn null_value_removes_attribute() {
        let context = Context::builder("k")
            .set_value("a", json!(1))
            .set_value("a", Value::Null)
            .build()
            .unwrap();
        assert!(!context.custom_attributes().contains_key("a"));
    }

    #[test]
    fn mistyped_built_in_is_ignored() {
        let context = Context::builder("k").set_value("anonymous", json!("yes")).build().unwrap();
        assert!(!context.anonymous());
        assert!(!context.custom_attributes().contains_key("anonymous"));
    }

    #[test]
    fn multi_of_one_collapses() {
        let single = Context::builder("u").build().unwrap();
        let built = Context::multi_builder().add(single.clone()).build().unwrap();
        assert_eq!(built, single);
        assert!(!built.is_multi());
    }

    #[test]
    fn multi_rejects_duplicates_and_nesting() {
        let a = Context::builder("a").build().unwrap();
        let b = Context::builder("b").build().unwrap();
        let err = Context::multi_builder().add(a.clone()).add(b).build().unwrap_err();
        assert!(matches!(err, ContextError::DuplicateKind { .. }));

        let org = Context::builder("o").kind("org").build().unwrap();
        let multi = Context::multi_builder().add(a).add(org).build().unwrap();
        let other = Context::builder("d").kind("device").build().unwrap();
        let err = Context::multi_builder().add(multi).add(other).build().unwrap_err();
        assert!(matches!(err, ContextError::NestedMultiContext));
    }

    #[test]
    fn empty_multi_rejected() {
        assert_eq!(
            Context::multi_builder().build().unwrap_err(),
            ContextError::EmptyMultiContext
        );
    }
}
