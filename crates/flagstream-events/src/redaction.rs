//! Context serialization for event payloads, with private-attribute
//! redaction.

use serde_json::{json, Map, Value};

use flagstream_core::context::{AttributeRef, Context};

/// Serializes contexts into event JSON, applying the private-attribute
/// policy. Redacted attribute names are recorded under
/// `_meta.redactedAttributes` so the service can display what was withheld.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventContextFormatter {
    all_attributes_private: bool,
    global_private: Vec<AttributeRef>,
}

impl EventContextFormatter {
    pub(crate) fn new(all_attributes_private: bool, global_private: Vec<AttributeRef>) -> Self {
        Self {
            all_attributes_private,
            global_private,
        }
    }

    /// Serialize a context. When `redact_anonymous` is set, components whose
    /// `anonymous` flag is true have all their attributes treated as private
    /// (used for feature events).
    pub(crate) fn format(&self, context: &Context, redact_anonymous: bool) -> Value {
        if context.is_multi() {
            let mut object = Map::new();
            object.insert("kind".to_string(), json!("multi"));
            for single in context.individual_contexts() {
                object.insert(
                    single.kind().as_str().to_string(),
                    self.format_single(single, false, redact_anonymous),
                );
            }
            Value::Object(object)
        } else {
            self.format_single(context, true, redact_anonymous)
        }
    }

    fn format_single(&self, context: &Context, with_kind: bool, redact_anonymous: bool) -> Value {
        let mut object = Map::new();
        if with_kind {
            object.insert("kind".to_string(), json!(context.kind().as_str()));
        }
        object.insert("key".to_string(), json!(context.key()));
        if context.anonymous() {
            object.insert("anonymous".to_string(), json!(true));
        }

        let redact_all = self.all_attributes_private || (redact_anonymous && context.anonymous());
        let mut redacted: Vec<String> = Vec::new();

        if redact_all {
            if context.name().is_some() {
                redacted.push("name".to_string());
            }
            for name in context.custom_attributes().keys() {
                redacted.push(name.clone());
            }
        } else {
            if let Some(name) = context.name() {
                object.insert("name".to_string(), json!(name));
            }
            for (name, value) in context.custom_attributes() {
                object.insert(name.clone(), value.clone());
            }
            for reference in self.global_private.iter().chain(context.private_attributes()) {
                redact_one(&mut object, reference, &mut redacted);
            }
        }

        if !redacted.is_empty() {
            redacted.sort();
            object.insert("_meta".to_string(), json!({"redactedAttributes": redacted}));
        }
        Value::Object(object)
    }
}

/// Remove the referenced attribute from the serialized object, recording its
/// reference string when something was actually removed. `key`, `kind`, and
/// `anonymous` are identifiers, never redacted.
fn redact_one(object: &mut Map<String, Value>, reference: &AttributeRef, redacted: &mut Vec<String>) {
    if !reference.is_valid() {
        return;
    }
    let components = reference.components();
    let first = components[0].as_str();
    if matches!(first, "key" | "kind" | "anonymous" | "_meta") {
        return;
    }
    if components.len() == 1 {
        if object.remove(first).is_some() {
            redacted.push(reference.as_str().to_string());
        }
        return;
    }
    // Nested redaction: walk to the parent object of the leaf.
    let mut current = object.get_mut(first);
    for component in &components[1..components.len() - 1] {
        current = match current {
            Some(Value::Object(map)) => map.get_mut(component.as_str()),
            _ => None,
        };
    }
    if let (Some(Value::Object(parent)), Some(leaf)) = (current, components.last()) {
        if parent.remove(leaf.as_str()).is_some() {
            redacted.push(reference.as_str().to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn formatter() -> EventContextFormatter {
        EventContextFormatter::new(false, Vec::new())
    }

    #[test]
    fn plain_context_serializes_attributes() {
        let context = Context::builder("u1")
            .name("Lucy")
            .set_value("email", json!("l@example.com"))
            .build()
            .unwrap();
        assert_eq!(
            formatter().format(&context, false),
            json!({"kind": "user", "key": "u1", "name": "Lucy", "email": "l@example.com"})
        );
    }

    #[test]
    fn anonymous_flag_included_only_when_true() {
        let anon = Context::builder("u").anonymous(true).build().unwrap();
        assert_eq!(
            formatter().format(&anon, false),
            json!({"kind": "user", "key": "u", "anonymous": true})
        );
    }

    #[test]
    fn context_private_attributes_redacted_and_recorded() {
        let context = Context::builder("u1")
            .set_value("email", json!("l@example.com"))
            .set_value("plan", json!("pro"))
            .private_attribute("email")
            .build()
            .unwrap();
        assert_eq!(
            formatter().format(&context, false),
            json!({
                "kind": "user", "key": "u1", "plan": "pro",
                "_meta": {"redactedAttributes": ["email"]},
            })
        );
    }

    #[test]
    fn global_private_and_nested_pointer() {
        let formatter = EventContextFormatter::new(
            false,
            vec![AttributeRef::new("/address/city"), AttributeRef::new("ghost")],
        );
        let context = Context::builder("u1")
            .set_value("address", json!({"city": "Oakland", "zip": "94612"}))
            .build()
            .unwrap();
        assert_eq!(
            formatter.format(&context, false),
            json!({
                "kind": "user", "key": "u1",
                "address": {"zip": "94612"},
                "_meta": {"redactedAttributes": ["/address/city"]},
            })
        );
    }

    #[test]
    fn all_attributes_private_keeps_identifiers() {
        let formatter = EventContextFormatter::new(true, Vec::new());
        let context = Context::builder("u1")
            .name("Lucy")
            .set_value("email", json!("x"))
            .build()
            .unwrap();
        let value = formatter.format(&context, false);
        assert_eq!(value["key"], json!("u1"));
        assert_eq!(value["kind"], json!("user"));
        assert!(value.get("name").is_none());
        assert!(value.get("email").is_none());
        let redacted = value["_meta"]["redactedAttributes"].as_array().unwrap();
        assert_eq!(redacted.len(), 2);
    }

    #[test]
    fn anonymous_redaction_applies_per_component() {
        let user = Context::builder("u")
            .anonymous(true)
            .set_value("email", json!("x"))
            .build()
            .unwrap();
        let org = Context::builder("acme")
            .kind("org")
            .set_value("tier", json!("gold"))
            .build()
            .unwrap();
        let multi = Context::multi_builder().add(user).add(org).build().unwrap();
        let value = formatter().format(&multi, true);
        assert_eq!(value["kind"], json!("multi"));
        assert!(value["user"].get("email").is_none());
        assert_eq!(value["org"]["tier"], json!("gold"));
        // Without anonymous redaction the attribute is kept.
        let value = formatter().format(&multi, false);
        assert_eq!(value["user"]["email"], json!("x"));
    }
}
