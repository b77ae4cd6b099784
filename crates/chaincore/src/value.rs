//! Structured payloads passed between nodes.

pub use serde_json::{json, Map, Value};

/// Message used when a workflow reaches `ERROR` without a `message` field.
pub const DEFAULT_ERROR_MESSAGE: &str = "Workflow ended in ERROR";

/// Shallow-merge fan-in contributions.
///
/// A single contribution is returned verbatim. With several, object keys are
/// merged in order and later contributors overwrite earlier ones. Non-object
/// contributions are skipped unless nothing else is an object, in which case
/// the last one wins.
pub fn shallow_merge(contributions: Vec<Value>) -> Value {
    if contributions.len() <= 1 {
        return contributions.into_iter().next().unwrap_or(Value::Null);
    }

    if !contributions.iter().any(Value::is_object) {
        return contributions.into_iter().last().unwrap_or(Value::Null);
    }

    let mut merged = Map::new();
    for contribution in contributions {
        if let Value::Object(fields) = contribution {
            for (key, value) in fields {
                merged.insert(key, value);
            }
        }
    }
    Value::Object(merged)
}

/// The `message` field of an `ERROR` payload.
pub fn error_message(value: &Value) -> Option<String> {
    match value.get("message")? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Short rendering for log lines.
pub fn preview(value: &Value, max: usize) -> String {
    let mut text = value.to_string();
    if text.len() > max {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push('…');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_contribution_is_verbatim() {
        assert_eq!(shallow_merge(vec![json!([1, 2])]), json!([1, 2]));
        assert_eq!(shallow_merge(vec![]), Value::Null);
    }

    #[test]
    fn later_contributors_overwrite() {
        let merged = shallow_merge(vec![
            json!({ "m": 6, "shared": "first" }),
            json!({ "p": 5, "shared": "second" }),
        ]);
        assert_eq!(merged, json!({ "m": 6, "p": 5, "shared": "second" }));
    }

    #[test]
    fn scalars_are_ignored_next_to_objects() {
        let merged = shallow_merge(vec![json!(1), json!({ "a": true }), Value::Null]);
        assert_eq!(merged, json!({ "a": true }));
        assert_eq!(shallow_merge(vec![json!(1), json!("x")]), json!("x"));
    }

    #[test]
    fn reads_error_message() {
        assert_eq!(
            error_message(&json!({ "message": "5<=10 :(" })).as_deref(),
            Some("5<=10 :(")
        );
        assert_eq!(error_message(&json!({ "code": 3 })), None);
        assert_eq!(error_message(&json!("plain")), None);
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let text = preview(&json!("ééééé"), 4);
        assert!(text.ends_with('…'));
    }
}
