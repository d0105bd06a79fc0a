//! Values crossing the JS boundary
//!
//! `JsValue` is the engine-neutral form of anything a script passes to or
//! receives from native code. Shared objects never cross as pointers, only
//! as their registry identity.

use crate::shared::ObjectId;
use serde_json::{Map, Number, Value as Json};
use std::collections::BTreeMap;
use std::fmt;

/// Key used when a shared-object identity is written out as JSON.
pub const OBJECT_ID_KEY: &str = "__tetherObjectId";

/// Raw JavaScript value, as handed over by an engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum JsValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<JsValue>),
    Object(BTreeMap<String, JsValue>),
    /// Identity of a native object held by a runtime's shared object registry.
    Shared(ObjectId),
}

impl JsValue {
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, JsValue)>,
    {
        JsValue::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// `typeof`-like name, used in conversion errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            JsValue::Undefined => "undefined",
            JsValue::Null => "null",
            JsValue::Bool(_) => "boolean",
            JsValue::Number(_) => "number",
            JsValue::String(_) => "string",
            JsValue::Array(_) => "array",
            JsValue::Object(_) => "object",
            JsValue::Shared(_) => "shared object",
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, JsValue::Undefined | JsValue::Null)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            JsValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JsValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            JsValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&JsValue> {
        match self {
            JsValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// JSON form. Undefined becomes null, non-finite numbers become null.
    pub fn to_json(&self) -> Json {
        match self {
            JsValue::Undefined | JsValue::Null => Json::Null,
            JsValue::Bool(b) => Json::Bool(*b),
            JsValue::Number(n) => number_to_json(*n),
            JsValue::String(s) => Json::String(s.clone()),
            JsValue::Array(items) => Json::Array(items.iter().map(JsValue::to_json).collect()),
            JsValue::Object(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<Map<_, _>>(),
            ),
            JsValue::Shared(id) => {
                let mut map = Map::new();
                map.insert(OBJECT_ID_KEY.to_string(), Json::from(id.get()));
                Json::Object(map)
            }
        }
    }
}

fn number_to_json(n: f64) -> Json {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Json::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Json::Number).unwrap_or(Json::Null)
    }
}

impl From<Json> for JsValue {
    fn from(json: Json) -> Self {
        match json {
            Json::Null => JsValue::Null,
            Json::Bool(b) => JsValue::Bool(b),
            Json::Number(n) => JsValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => JsValue::String(s),
            Json::Array(items) => JsValue::Array(items.into_iter().map(JsValue::from).collect()),
            Json::Object(map) => {
                if map.len() == 1 {
                    if let Some(id) = map.get(OBJECT_ID_KEY).and_then(Json::as_u64) {
                        return JsValue::Shared(ObjectId::from_raw(id));
                    }
                }
                JsValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<bool> for JsValue {
    fn from(value: bool) -> Self {
        JsValue::Bool(value)
    }
}

impl From<f64> for JsValue {
    fn from(value: f64) -> Self {
        JsValue::Number(value)
    }
}

impl From<i32> for JsValue {
    fn from(value: i32) -> Self {
        JsValue::Number(value as f64)
    }
}

impl From<i64> for JsValue {
    fn from(value: i64) -> Self {
        JsValue::Number(value as f64)
    }
}

impl From<&str> for JsValue {
    fn from(value: &str) -> Self {
        JsValue::String(value.to_string())
    }
}

impl From<String> for JsValue {
    fn from(value: String) -> Self {
        JsValue::String(value)
    }
}

impl From<ObjectId> for JsValue {
    fn from(value: ObjectId) -> Self {
        JsValue::Shared(value)
    }
}

impl<T: Into<JsValue>> From<Vec<T>> for JsValue {
    fn from(values: Vec<T>) -> Self {
        JsValue::Array(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<JsValue>> From<Option<T>> for JsValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(JsValue::Null)
    }
}

impl fmt::Display for JsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsValue::Undefined => write!(f, "undefined"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_keeps_integers_integral() {
        assert_eq!(JsValue::Number(5.0).to_json(), json!(5));
        assert_eq!(JsValue::Number(2.5).to_json(), json!(2.5));
        assert_eq!(JsValue::Number(f64::NAN).to_json(), Json::Null);
    }

    #[test]
    fn shared_identity_survives_json() {
        let id = ObjectId::from_raw(42);
        let json = JsValue::Shared(id).to_json();
        assert_eq!(json, json!({ "__tetherObjectId": 42 }));
        assert_eq!(JsValue::from(json), JsValue::Shared(id));
    }

    #[test]
    fn objects_with_extra_keys_stay_objects() {
        let value = JsValue::from(json!({ "__tetherObjectId": 1, "name": "x" }));
        assert!(matches!(value, JsValue::Object(_)));
        assert_eq!(value.get("name"), Some(&JsValue::from("x")));
    }

    #[test]
    fn display_uses_json_form() {
        let value = JsValue::object([("a", JsValue::from(1)), ("b", JsValue::Null)]);
        assert_eq!(value.to_string(), r#"{"a":1,"b":null}"#);
        assert_eq!(JsValue::Undefined.to_string(), "undefined");
    }
}
