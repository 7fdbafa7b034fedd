//! Attribute references: names or slash-delimited pointers into context
//! attributes, used by clauses, `bucketBy`, and private-attribute redaction.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A reference to a (possibly nested) context attribute.
///
/// Two syntaxes are accepted. A plain name (`"email"`) refers to a top-level
/// attribute, even if it contains slashes-free special characters. A string
/// starting with `/` is a pointer (`"/address/city"`) whose components are
/// unescaped with `~1` → `/` and `~0` → `~`.
///
/// Parsing never fails: an unusable reference (empty string, `"/"`, empty
/// path component) is retained verbatim but reports `!is_valid()`. Clauses
/// with invalid references never match, and redaction treats them literally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeRef {
    raw: String,
    components: Vec<String>,
    valid: bool,
}

impl AttributeRef {
    /// Parse a reference from its string form.
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.is_empty() || raw == "/" {
            return Self {
                raw,
                components: Vec::new(),
                valid: false,
            };
        }
        if let Some(path) = raw.strip_prefix('/') {
            let components: Vec<String> = path.split('/').map(unescape_component).collect();
            let valid = components.iter().all(|c| !c.is_empty());
            Self {
                raw,
                components: if valid { components } else { Vec::new() },
                valid,
            }
        } else {
            Self {
                components: vec![raw.clone()],
                raw,
                valid: true,
            }
        }
    }

    /// Build a reference to a single top-level attribute, bypassing pointer
    /// parsing entirely.
    pub fn literal(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            raw: name.clone(),
            components: vec![name],
            valid: true,
        }
    }

    /// Whether the reference parsed into a usable path.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The original string form.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Path components; empty when invalid.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Number of path components.
    pub fn depth(&self) -> usize {
        self.components.len()
    }
}

fn unescape_component(component: &str) -> String {
    component.replace("~1", "/").replace("~0", "~")
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for AttributeRef {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Serialize for AttributeRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for AttributeRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::new(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("name", &["name"]; "plain name")]
    #[test_case("name/with/slashes-free", &["name/with/slashes-free"]; "plain name is not split")]
    #[test_case("/name", &["name"]; "single component pointer")]
    #[test_case("/address/city", &["address", "city"]; "nested pointer")]
    #[test_case("/a~1b/c~0d", &["a/b", "c~d"]; "escapes")]
    fn parses_valid_refs(raw: &str, expected: &[&str]) {
        let r = AttributeRef::new(raw);
        assert!(r.is_valid());
        assert_eq!(r.components(), expected);
    }

    #[test_case(""; "empty")]
    #[test_case("/"; "bare slash")]
    #[test_case("//"; "empty components")]
    #[test_case("/a//b"; "interior empty component")]
    fn rejects_invalid_refs(raw: &str) {
        let r = AttributeRef::new(raw);
        assert!(!r.is_valid());
        assert!(r.components().is_empty());
        assert_eq!(r.as_str(), raw);
    }

    #[test]
    fn literal_never_parses_pointers() {
        let r = AttributeRef::literal("/looks/like/a/pointer");
        assert!(r.is_valid());
        assert_eq!(r.components(), &["/looks/like/a/pointer"]);
    }

    #[test]
    fn serde_round_trip() {
        let r = AttributeRef::new("/address/city");
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, "\"/address/city\"");
        let back: AttributeRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
