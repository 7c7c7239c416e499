//! Shard key patterns, key extraction, and index compatibility checks.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{ControlError, ControlResult};
use crate::Document;

/// Direction of one key field. `Hashed` is only legal as a single-field
/// pattern; compound patterns are all `Ascending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyDirection {
    Ascending,
    Hashed,
}

/// An ordered shard key pattern, e.g. `{a: 1, b: 1}` or `{a: "hashed"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPattern {
    pub fields: Vec<(String, KeyDirection)>,
}

impl KeyPattern {
    pub fn ascending(field: &str) -> Self {
        Self {
            fields: vec![(field.to_string(), KeyDirection::Ascending)],
        }
    }

    pub fn hashed(field: &str) -> Self {
        Self {
            fields: vec![(field.to_string(), KeyDirection::Hashed)],
        }
    }

    /// Parse a key document of the form `{"a": 1}` or `{"a": "hashed"}`.
    ///
    /// The allowable patterns are either a hashed single field or a
    /// compound list of ascending fields; anything else is rejected.
    pub fn parse(doc: &Document) -> ControlResult<Self> {
        let obj = doc
            .as_object()
            .ok_or_else(|| ControlError::validation("shard key must be a document"))?;
        if obj.is_empty() {
            return Err(ControlError::validation("no shard key"));
        }

        let mut fields = Vec::with_capacity(obj.len());
        let mut saw_hashed = false;
        for (name, value) in obj {
            match value {
                Value::String(s) if s == "hashed" => {
                    saw_hashed = true;
                    fields.push((name.clone(), KeyDirection::Hashed));
                }
                Value::String(other) => {
                    return Err(ControlError::validation(format!(
                        "unrecognized string: {other}"
                    )));
                }
                Value::Number(n) if n.as_f64() == Some(1.0) => {
                    fields.push((name.clone(), KeyDirection::Ascending));
                }
                _ => {
                    return Err(ControlError::validation(
                        "unsupported shard key pattern: pattern must either be a single \
                         hashed field, or a list of ascending fields",
                    ));
                }
            }
        }

        if saw_hashed && fields.len() > 1 {
            return Err(ControlError::validation(
                "hashed shard keys currently only support single field keys",
            ));
        }

        Ok(Self { fields })
    }

    /// Render back to the `{"a": 1}` document form.
    pub fn to_document(&self) -> Document {
        let mut obj = Map::new();
        for (name, dir) in &self.fields {
            let value = match dir {
                KeyDirection::Ascending => json!(1),
                KeyDirection::Hashed => json!("hashed"),
            };
            obj.insert(name.clone(), value);
        }
        Value::Object(obj)
    }

    pub fn first_field(&self) -> &str {
        &self.fields[0].0
    }

    pub fn is_hashed(&self) -> bool {
        self.fields
            .iter()
            .any(|(_, dir)| *dir == KeyDirection::Hashed)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// Two patterns are the same key when field lists and directions match.
    pub fn same_pattern(&self, other: &KeyPattern) -> bool {
        self.fields == other.fields
    }

    /// Whether this pattern's field list is a prefix of `index`'s.
    pub fn is_prefix_of(&self, index: &KeyPattern) -> bool {
        if self.fields.len() > index.fields.len() {
            return false;
        }
        self.fields
            .iter()
            .zip(index.fields.iter())
            .all(|((a, _), (b, _))| a == b)
    }

    /// Numeric value of the pattern's first field in `doc`.
    ///
    /// The new-key domain estimate only supports scalar numeric values;
    /// anything else is an `UnsupportedKey`.
    pub fn first_value_numeric(&self, doc: &Document) -> ControlResult<f64> {
        let field = self.first_field();
        match doc.get(field) {
            Some(Value::Number(n)) => n.as_f64().ok_or_else(|| {
                ControlError::UnsupportedKey(format!("field {field} is not a finite number"))
            }),
            Some(other) => Err(ControlError::UnsupportedKey(format!(
                "field {field} has non-numeric value {other}"
            ))),
            None => Err(ControlError::UnsupportedKey(format!(
                "field {field} missing from document"
            ))),
        }
    }
}

/// One index as reported by a group member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSpec {
    pub key: KeyPattern,
    pub unique: bool,
    pub sparse: bool,
}

/// Uniqueness can only be maintained when the proposed shard key is a
/// prefix of the unique index. The `_id` index is exempt.
pub fn unique_index_compatible(proposed: &KeyPattern, index_key: &KeyPattern) -> bool {
    index_key.first_field() == "_id" || proposed.is_prefix_of(index_key)
}

/// An index is useful for a proposed key when it is not sparse and the
/// proposed key is a prefix of it.
pub fn has_useful_index(proposed: &KeyPattern, indexes: &[IndexSpec]) -> bool {
    indexes
        .iter()
        .any(|idx| !idx.sparse && proposed.is_prefix_of(&idx.key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_ascending_and_hashed_patterns() {
        let compound = KeyPattern::parse(&json!({"a": 1, "b": 1})).expect("compound");
        assert_eq!(compound.fields.len(), 2);
        assert!(!compound.is_hashed());

        let hashed = KeyPattern::parse(&json!({"a": "hashed"})).expect("hashed");
        assert!(hashed.is_hashed());
        assert_eq!(hashed.first_field(), "a");
    }

    #[test]
    fn rejects_bad_patterns() {
        assert!(KeyPattern::parse(&json!({})).is_err());
        assert!(KeyPattern::parse(&json!({"a": -1})).is_err());
        assert!(KeyPattern::parse(&json!({"a": "text"})).is_err());
        assert!(KeyPattern::parse(&json!({"a": "hashed", "b": 1})).is_err());
        assert!(KeyPattern::parse(&json!("a")).is_err());
    }

    #[test]
    fn prefix_and_uniqueness_checks() {
        let proposed = KeyPattern::parse(&json!({"a": 1})).expect("key");
        let ab = KeyPattern::parse(&json!({"a": 1, "b": 1})).expect("key");
        let b = KeyPattern::parse(&json!({"b": 1})).expect("key");
        let id = KeyPattern::ascending("_id");

        assert!(proposed.is_prefix_of(&ab));
        assert!(!proposed.is_prefix_of(&b));
        assert!(unique_index_compatible(&proposed, &id));
        assert!(unique_index_compatible(&proposed, &ab));
        assert!(!unique_index_compatible(&proposed, &b));
    }

    #[test]
    fn useful_index_ignores_sparse() {
        let proposed = KeyPattern::ascending("a");
        let sparse_only = vec![IndexSpec {
            key: KeyPattern::ascending("a"),
            unique: false,
            sparse: true,
        }];
        assert!(!has_useful_index(&proposed, &sparse_only));

        let dense = vec![IndexSpec {
            key: KeyPattern::parse(&json!({"a": 1, "b": 1})).expect("key"),
            unique: false,
            sparse: false,
        }];
        assert!(has_useful_index(&proposed, &dense));
    }

    #[test]
    fn numeric_first_value_extraction() {
        let key = KeyPattern::ascending("b");
        assert_eq!(
            key.first_value_numeric(&json!({"b": 7})).expect("numeric"),
            7.0
        );
        assert!(matches!(
            key.first_value_numeric(&json!({"b": "x"})),
            Err(ControlError::UnsupportedKey(_))
        ));
        assert!(matches!(
            key.first_value_numeric(&json!({"a": 1})),
            Err(ControlError::UnsupportedKey(_))
        ));
    }
}
