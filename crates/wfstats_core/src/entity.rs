use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

pub const TYPE_KEY: &str = "Z1K1";
pub const PERSISTENT_ID_KEY: &str = "Z2K1";
pub const PERSISTENT_VALUE_KEY: &str = "Z2K2";
pub const STRING_VALUE_KEY: &str = "Z6K1";
pub const REFERENCE_ID_KEY: &str = "Z9K1";
pub const REFERENCE_TYPE: &str = "Z9";
pub const FUNCTION_TESTERS_KEY: &str = "Z8K3";
pub const FUNCTION_IMPLEMENTATIONS_KEY: &str = "Z8K4";
pub const TRANSLATION_LIST_KEY: &str = "Z12K1";
pub const LABEL_TEXT_KEY: &str = "Z11K2";

/// Nodes nested deeper than this are ignored by the metric walks.
pub const MAX_WALK_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Function,
    Implementation,
    Tester,
}

impl EntityKind {
    pub fn type_tag(self) -> &'static str {
        match self {
            Self::Function => "Z8",
            Self::Implementation => "Z14",
            Self::Tester => "Z20",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Implementation => "implementation",
            Self::Tester => "tester",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.type_tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("record has no `{PERSISTENT_ID_KEY}.{STRING_VALUE_KEY}` identifier")]
    Missing,
    #[error("record identifier is not a string")]
    NotAString,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
    Error,
    Unknown,
}

impl TestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raw knowledge-base record. Cloning is cheap; the JSON tree is shared.
#[derive(Debug, Clone)]
pub struct ZObject {
    raw: Arc<Value>,
    id: Result<String, IdentityError>,
}

impl ZObject {
    pub fn new(raw: Value) -> Self {
        Self::with_title(raw, None)
    }

    /// Accepts both line shapes: a bare record, or `{"title": .., "data": ..}`.
    pub fn from_line_value(value: Value) -> Self {
        match value {
            Value::Object(mut map)
                if !map.contains_key(TYPE_KEY) && map.contains_key("data") =>
            {
                let title = map
                    .get("title")
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                let data = map.remove("data").unwrap_or(Value::Null);
                Self::with_title(data, title)
            }
            other => Self::new(other),
        }
    }

    fn with_title(raw: Value, title: Option<String>) -> Self {
        let id = match (extract_id(&raw), title) {
            (Err(IdentityError::Missing), Some(title)) if raw.get(PERSISTENT_ID_KEY).is_none() => {
                Ok(title)
            }
            (id, _) => id,
        };
        Self {
            raw: Arc::new(raw),
            id,
        }
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn id(&self) -> Result<&str, IdentityError> {
        self.id.as_deref().map_err(Clone::clone)
    }

    pub fn is_kind(&self, kind: EntityKind) -> bool {
        classify(&self.raw, kind)
    }

    pub fn alias_count(&self) -> usize {
        count_aliases(&self.raw)
    }

    pub fn language_count(&self) -> usize {
        count_languages(&self.raw)
    }

    /// The persistent value (`Z2K2`), when it is an object.
    pub fn value_object(&self) -> Option<&serde_json::Map<String, Value>> {
        self.raw.get(PERSISTENT_VALUE_KEY).and_then(Value::as_object)
    }
}

/// Shared capability set of the three record variants.
pub trait Entity: Sized {
    const KIND: EntityKind;

    fn from_object(object: ZObject) -> Self;

    fn object(&self) -> &ZObject;

    fn from_value(raw: Value) -> Self {
        Self::from_object(ZObject::new(raw))
    }

    fn is_correct_kind(&self) -> bool {
        self.object().is_kind(Self::KIND)
    }

    fn id(&self) -> Result<&str, IdentityError> {
        self.object().id()
    }

    fn alias_count(&self) -> usize {
        self.object().alias_count()
    }

    fn language_count(&self) -> usize {
        self.object().language_count()
    }
}

#[derive(Debug, Clone)]
pub struct Tester {
    object: ZObject,
}

impl Entity for Tester {
    const KIND: EntityKind = EntityKind::Tester;

    fn from_object(object: ZObject) -> Self {
        Self { object }
    }

    fn object(&self) -> &ZObject {
        &self.object
    }
}

#[derive(Debug, Clone)]
pub struct Implementation {
    object: ZObject,
    /// tester id -> status, filled in by the status phase.
    pub test_results: BTreeMap<String, TestStatus>,
}

impl Entity for Implementation {
    const KIND: EntityKind = EntityKind::Implementation;

    fn from_object(object: ZObject) -> Self {
        Self {
            object,
            test_results: BTreeMap::new(),
        }
    }

    fn object(&self) -> &ZObject {
        &self.object
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    object: ZObject,
    pub testers: Vec<Arc<Tester>>,
    pub implementations: Vec<Implementation>,
}

impl Function {
    pub fn implementation_count(&self) -> usize {
        self.implementations.len()
    }

    pub fn tester_count(&self) -> usize {
        self.testers.len()
    }
}

impl Entity for Function {
    const KIND: EntityKind = EntityKind::Function;

    fn from_object(object: ZObject) -> Self {
        Self {
            object,
            testers: Vec::new(),
            implementations: Vec::new(),
        }
    }

    fn object(&self) -> &ZObject {
        &self.object
    }
}

/// True iff `Z2K2.Z1K1` equals the kind's type tag. Never fails.
pub fn classify(record: &Value, kind: EntityKind) -> bool {
    record
        .get(PERSISTENT_VALUE_KEY)
        .and_then(Value::as_object)
        .and_then(|value| value.get(TYPE_KEY))
        .and_then(reference_id)
        == Some(kind.type_tag())
}

pub fn extract_id(record: &Value) -> Result<String, IdentityError> {
    let id = record
        .get(PERSISTENT_ID_KEY)
        .and_then(|value| value.get(STRING_VALUE_KEY))
        .ok_or(IdentityError::Missing)?;
    id.as_str()
        .map(ToString::to_string)
        .ok_or(IdentityError::NotAString)
}

/// Reads an id out of either a bare string or a `Z9` reference object.
pub fn reference_id(value: &Value) -> Option<&str> {
    match value {
        Value::String(id) => Some(id.as_str()),
        Value::Object(map) if map.get(TYPE_KEY).and_then(Value::as_str) == Some(REFERENCE_TYPE) => {
            map.get(REFERENCE_ID_KEY).and_then(Value::as_str)
        }
        _ => None,
    }
}

/// Counts every object in the tree that carries a type discriminator.
pub fn count_aliases(root: &Value) -> usize {
    let mut count = 0usize;
    walk(root, |map| {
        if map.contains_key(TYPE_KEY) {
            count += 1;
        }
        WalkStep::Descend
    });
    count
}

/// Counts label entries with a text field under any translation list.
pub fn count_languages(root: &Value) -> usize {
    let mut count = 0usize;
    walk(root, |map| match map.get(TRANSLATION_LIST_KEY) {
        Some(Value::Array(entries)) => {
            count += entries
                .iter()
                .filter(|entry| {
                    entry
                        .as_object()
                        .is_some_and(|entry| entry.contains_key(LABEL_TEXT_KEY))
                })
                .count();
            WalkStep::SkipKey(TRANSLATION_LIST_KEY)
        }
        _ => WalkStep::Descend,
    });
    count
}

enum WalkStep {
    Descend,
    SkipKey(&'static str),
}

fn walk<'a, F>(root: &'a Value, mut visit: F)
where
    F: FnMut(&'a serde_json::Map<String, Value>) -> WalkStep,
{
    let mut stack = vec![(root, 0usize)];
    while let Some((node, depth)) = stack.pop() {
        if depth > MAX_WALK_DEPTH {
            tracing::debug!(depth, "skipping JSON node past walk depth limit");
            continue;
        }
        match node {
            Value::Object(map) => {
                let skip = match visit(map) {
                    WalkStep::Descend => None,
                    WalkStep::SkipKey(key) => Some(key),
                };
                for (key, child) in map {
                    if Some(key.as_str()) != skip && is_container(child) {
                        stack.push((child, depth + 1));
                    }
                }
            }
            Value::Array(items) => {
                for child in items.iter().filter(|child| is_container(child)) {
                    stack.push((child, depth + 1));
                }
            }
            _ => {}
        }
    }
}

fn is_container(value: &Value) -> bool {
    matches!(value, Value::Object(_) | Value::Array(_))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn function_record() -> Value {
        json!({
            "Z1K1": "Z2",
            "Z2K1": {"Z1K1": "Z6", "Z6K1": "Z10000"},
            "Z2K2": {
                "Z1K1": "Z8",
                "Z8K3": ["Z20", "Z10001", "Z10002"],
                "Z8K4": ["Z14", "Z10003"]
            },
            "Z2K3": {
                "Z1K1": "Z12",
                "Z12K1": [
                    "Z11",
                    {"Z1K1": "Z11", "Z11K1": "Z1002", "Z11K2": "join strings"},
                    {"Z1K1": "Z11", "Z11K1": "Z1430", "Z11K2": "Zeichenketten verbinden"},
                    {"Z1K1": "Z11", "Z11K1": "Z1004"}
                ]
            }
        })
    }

    #[test]
    fn classify_matches_only_expected_tag() {
        let record = function_record();
        assert!(classify(&record, EntityKind::Function));
        assert!(!classify(&record, EntityKind::Tester));
        assert!(!classify(&record, EntityKind::Implementation));
    }

    #[test]
    fn classify_tolerates_malformed_shapes() {
        for record in [
            json!(null),
            json!("Z8"),
            json!([1, 2, 3]),
            json!({"Z2K2": "Z8"}),
            json!({"Z2K2": {"Z8K1": []}}),
            json!({"Z2K2": {"Z1K1": 8}}),
        ] {
            assert!(!classify(&record, EntityKind::Function), "{record}");
        }
    }

    #[test]
    fn classify_accepts_reference_form_discriminator() {
        let record = json!({"Z2K2": {"Z1K1": {"Z1K1": "Z9", "Z9K1": "Z20"}}});
        assert!(classify(&record, EntityKind::Tester));
    }

    #[test]
    fn extract_id_reads_persistent_identifier() {
        let entity = Function::from_value(json!({
            "Z1K1": "Z2",
            "Z2K1": {"Z1K1": "Z6", "Z6K1": "Z11515"}
        }));
        assert_eq!(entity.id(), Ok("Z11515"));
    }

    #[test]
    fn extract_id_reports_missing_and_non_string() {
        let missing = Tester::from_value(json!({"Z1K1": "Z2", "Z2K1": {"Z1K1": "Z6"}}));
        assert_eq!(missing.id(), Err(IdentityError::Missing));

        let numeric = Tester::from_value(json!({"Z2K1": {"Z6K1": 42}}));
        assert_eq!(numeric.id(), Err(IdentityError::NotAString));

        let scalar = Tester::from_value(json!("Z1"));
        assert_eq!(scalar.id(), Err(IdentityError::Missing));
    }

    #[test]
    fn early_line_variant_is_unwrapped() {
        let object = ZObject::from_line_value(json!({"title": "Z10000", "data": function_record()}));
        assert_eq!(object.id(), Ok("Z10000"));
        assert!(object.is_kind(EntityKind::Function));

        let untitled_payload = json!({"Z2K2": {"Z1K1": "Z20"}});
        let object = ZObject::from_line_value(json!({"title": "Z7", "data": untitled_payload}));
        assert_eq!(object.id(), Ok("Z7"));
    }

    #[test]
    fn alias_count_includes_every_typed_object() {
        let function = Function::from_value(function_record());
        // root, Z2K1, Z2K2, Z2K3 and three Z11 labels
        assert_eq!(function.alias_count(), 7);
        assert_eq!(count_aliases(&json!([1, "x", null])), 0);
    }

    #[test]
    fn language_count_needs_text_field() {
        let function = Function::from_value(function_record());
        assert_eq!(function.language_count(), 2);
        assert_eq!(count_languages(&json!({"Z12K1": "not a list"})), 0);
    }

    #[test]
    fn walks_stop_at_depth_limit() {
        let mut deep = json!({"Z1K1": "Z6"});
        for _ in 0..(MAX_WALK_DEPTH + 10) {
            deep = json!({"Z1K1": "Z99", "next": deep});
        }
        let counted = count_aliases(&deep);
        assert_eq!(counted, MAX_WALK_DEPTH + 1);
    }

    #[test]
    fn test_status_serializes_as_lowercase_name() {
        let statuses = [
            TestStatus::Pass,
            TestStatus::Fail,
            TestStatus::Error,
            TestStatus::Unknown,
        ];
        let rendered = serde_json::to_value(statuses).expect("serialize statuses");
        assert_eq!(rendered, json!(["pass", "fail", "error", "unknown"]));
    }
}
