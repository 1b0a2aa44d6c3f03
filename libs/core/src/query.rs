//! Document criteria used to look up users and chats.
//!
//! Paths are dotted (`hooks.token`, `settings.trello.board`) and traverse
//! arrays implicitly: `hooks.token` matches when any hook carries the token.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Eq { path: String, value: Value },
    Exists { path: String, exists: bool },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    conditions: Vec<Condition>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Documents whose hooks include `token`.
    pub fn hook_token(token: &str) -> Self {
        Self::new().eq("hooks.token", token)
    }

    pub fn id(id: i64) -> Self {
        Self::new().eq("id", id)
    }

    pub fn eq(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq {
            path: path.into(),
            value: value.into(),
        });
        self
    }

    pub fn exists(mut self, path: impl Into<String>, exists: bool) -> Self {
        self.conditions.push(Condition::Exists {
            path: path.into(),
            exists,
        });
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// The token when this query is exactly [`Query::hook_token`]; indexed
    /// backends answer it without a scan.
    pub fn as_hook_token(&self) -> Option<&str> {
        match self.conditions.as_slice() {
            [Condition::Eq { path, value }] if path == "hooks.token" => value.as_str(),
            _ => None,
        }
    }

    /// The id when this query is exactly [`Query::id`].
    pub fn as_id(&self) -> Option<i64> {
        match self.conditions.as_slice() {
            [Condition::Eq { path, value }] if path == "id" => value.as_i64(),
            _ => None,
        }
    }

    /// An empty query matches every document.
    pub fn matches(&self, doc: &Value) -> bool {
        self.conditions.iter().all(|cond| match cond {
            Condition::Eq { path, value } => resolve(doc, path).into_iter().any(|found| {
                found == value
                    || found
                        .as_array()
                        .map(|items| items.contains(value))
                        .unwrap_or(false)
            }),
            Condition::Exists { path, exists } => {
                let found = resolve(doc, path).into_iter().any(|v| !v.is_null());
                found == *exists
            }
        })
    }
}

fn resolve<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let mut out = Vec::new();
    collect(doc, &segments, &mut out);
    out
}

fn collect<'a>(value: &'a Value, segments: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(next) = map.get(*head) {
                collect(next, rest, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, segments, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_doc() -> Value {
        json!({
            "id": 42,
            "hooks": [
                {"token": "uAAA", "services": ["trello"], "chats": [10, 20]},
                {"token": "uBBB", "services": ["gmail"], "chats": []}
            ],
            "settings": {"trello": {"board": "b-1"}},
            "protected": {"gmail": {"oauth_token": "t"}}
        })
    }

    #[test]
    fn eq_traverses_arrays() {
        let doc = user_doc();
        assert!(Query::hook_token("uBBB").matches(&doc));
        assert!(!Query::hook_token("uCCC").matches(&doc));
        assert!(Query::new().eq("hooks.chats", 20).matches(&doc));
        assert!(Query::new().eq("hooks.services", "gmail").matches(&doc));
    }

    #[test]
    fn conditions_are_conjunctive() {
        let doc = user_doc();
        assert!(
            Query::id(42)
                .eq("settings.trello.board", "b-1")
                .matches(&doc)
        );
        assert!(!Query::id(42).eq("settings.trello.board", "b-2").matches(&doc));
    }

    #[test]
    fn exists_checks_presence() {
        let doc = user_doc();
        assert!(Query::new().exists("protected.gmail", true).matches(&doc));
        assert!(Query::new().exists("protected.trello", false).matches(&doc));
        assert!(!Query::new().exists("protected.trello", true).matches(&doc));
    }

    #[test]
    fn empty_query_matches_all() {
        assert!(Query::new().matches(&json!({})));
    }

    #[test]
    fn queries_serialize_with_op_tags() {
        let query = Query::hook_token("cX");
        let raw = serde_json::to_value(&query).unwrap();
        assert_eq!(raw["conditions"][0]["op"], "eq");
        let back: Query = serde_json::from_value(raw).unwrap();
        assert_eq!(back, query);
    }

    #[test]
    fn shortcut_queries_are_recognised() {
        assert_eq!(Query::hook_token("cX").as_hook_token(), Some("cX"));
        assert_eq!(Query::id(7).as_id(), Some(7));
        assert_eq!(Query::hook_token("cX").eq("id", 1).as_hook_token(), None);
        assert_eq!(Query::new().eq("hooks.services", "a").as_hook_token(), None);
        assert_eq!(Query::hook_token("cX").as_id(), None);
    }
}
