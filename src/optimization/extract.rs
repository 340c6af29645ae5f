//! Essential-projection extractors.
//!
//! An extractor picks the subset of a payload that affects what consumers
//! display. Projections should be deterministic: anything whose order does
//! not matter (id sets, tag lists) must come out sorted.

use super::hash::sort_values;
use serde_json::{Map, Value};

pub trait EssentialExtractor: Send + Sync {
    fn extract(&self, payload: &Value) -> Value;
}

/// The whole payload is essential.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityExtractor;

impl EssentialExtractor for IdentityExtractor {
    fn extract(&self, payload: &Value) -> Value {
        payload.clone()
    }
}

/// Keeps only the listed top-level fields. Missing fields project to null so
/// a field appearing or disappearing still changes the hash.
#[derive(Debug, Clone)]
pub struct FieldExtractor {
    fields: Vec<String>,
}

impl FieldExtractor {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl EssentialExtractor for FieldExtractor {
    fn extract(&self, payload: &Value) -> Value {
        let mut out = Map::new();
        for f in &self.fields {
            out.insert(f.clone(), payload.get(f).cloned().unwrap_or(Value::Null));
        }
        Value::Object(out)
    }
}

/// Projects arrays of objects to sorted sets of their ids.
///
/// `{"items": [{"id": "b", ..}, {"id": "a", ..}]}` with collection `items`
/// becomes `{"items": ["a", "b"]}`. Only membership is essential; any other
/// per-item change is ignored.
#[derive(Debug, Clone)]
pub struct IdSetExtractor {
    collections: Vec<String>,
    id_field: String,
}

impl IdSetExtractor {
    pub fn new<I, S>(collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            collections: collections.into_iter().map(Into::into).collect(),
            id_field: "id".to_string(),
        }
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }
}

impl EssentialExtractor for IdSetExtractor {
    fn extract(&self, payload: &Value) -> Value {
        let mut out = Map::new();
        for c in &self.collections {
            let mut ids: Vec<Value> = payload
                .get(c)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.get(&self.id_field))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            // duplicates are content: [a, a] is not [a]
            sort_values(&mut ids);
            out.insert(c.clone(), Value::Array(ids));
        }
        Value::Object(out)
    }
}

/// Extractor backed by a closure.
pub struct FnExtractor<F>(pub F);

impl<F> EssentialExtractor for FnExtractor<F>
where
    F: Fn(&Value) -> Value + Send + Sync,
{
    fn extract(&self, payload: &Value) -> Value {
        (self.0)(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_extractor_keeps_listed_fields() {
        let e = FieldExtractor::new(["items", "owner"]);
        let out = e.extract(&json!({"items": [1], "noise": 5}));
        assert_eq!(out, json!({"items": [1], "owner": null}));
    }

    #[test]
    fn test_id_set_extractor_sorts_and_ignores_other_fields() {
        let e = IdSetExtractor::new(["items"]);
        let a = e.extract(&json!({"items": [{"id": "b", "x": 1}, {"id": "a"}]}));
        let b = e.extract(&json!({"items": [{"id": "a"}, {"id": "b", "x": 2}]}));
        assert_eq!(a, json!({"items": ["a", "b"]}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_id_set_numeric_ids() {
        let e = IdSetExtractor::new(["boards"]).with_id_field("boardId");
        let out = e.extract(&json!({"boards": [{"boardId": 2}, {"boardId": 1}]}));
        assert_eq!(out, json!({"boards": [1, 2]}));
    }

    #[test]
    fn test_id_set_keeps_types_and_duplicates() {
        let e = IdSetExtractor::new(["items"]);
        let numeric = e.extract(&json!({"items": [{"id": 1}]}));
        let string = e.extract(&json!({"items": [{"id": "1"}]}));
        assert_ne!(numeric, string);

        let once = e.extract(&json!({"items": [{"id": "a"}]}));
        let twice = e.extract(&json!({"items": [{"id": "a"}, {"id": "a"}]}));
        assert_ne!(once, twice);
        assert_eq!(twice, json!({"items": ["a", "a"]}));
    }
}
