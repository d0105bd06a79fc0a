//! JSON messages exchanged with the prelude
//!
//! Native results travel as `{ status, value | error | id }`. Shared objects
//! additionally carry their class name so the script side can pick the
//! right prototype.

use serde_json::{json, Map, Value as Json};
use tether_core::{
    BridgeError, CallTarget, JsCallOutcome, JsValue, Member, ModuleExport, Runtime, Settlement,
    OBJECT_ID_KEY,
};

pub(crate) const CLASS_KEY: &str = "__tetherClass";

/// Script-facing JSON form of `value`.
pub(crate) fn to_script(runtime: Option<&Runtime>, value: &JsValue) -> Json {
    match value {
        JsValue::Shared(id) => {
            let class = runtime
                .and_then(|runtime| runtime.objects().class_of(*id))
                .map(|class| Json::from(class.name()))
                .unwrap_or(Json::Null);
            let mut map = Map::new();
            map.insert(OBJECT_ID_KEY.to_string(), Json::from(id.get()));
            map.insert(CLASS_KEY.to_string(), class);
            Json::Object(map)
        }
        JsValue::Array(items) => {
            Json::Array(items.iter().map(|item| to_script(runtime, item)).collect())
        }
        JsValue::Object(map) => Json::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), to_script(runtime, item)))
                .collect(),
        ),
        other => other.to_json(),
    }
}

pub(crate) fn settlement(runtime: Option<&Runtime>, outcome: &Settlement) -> Json {
    match outcome {
        Ok(JsValue::Undefined) => json!({ "status": "ok" }),
        Ok(value) => json!({ "status": "ok", "value": to_script(runtime, value) }),
        Err(error) => failure(error),
    }
}

pub(crate) fn outcome(runtime: &Runtime, outcome: JsCallOutcome) -> Json {
    match outcome {
        JsCallOutcome::Ready(settled) => settlement(Some(runtime), &settled),
        JsCallOutcome::Pending(id) => json!({ "status": "pending", "id": id }),
    }
}

pub(crate) fn failure(error: &BridgeError) -> Json {
    json!({ "status": "error", "error": error.to_js().to_json() })
}

/// Arguments encoded by the prelude; always an array.
pub(crate) fn decode_args(json: &str) -> Result<Vec<JsValue>, BridgeError> {
    let parsed: Json = serde_json::from_str(json).map_err(|error| BridgeError::JavaScript {
        message: format!("malformed call arguments: {error}"),
    })?;
    match JsValue::from(parsed) {
        JsValue::Array(args) => Ok(args),
        other => Err(BridgeError::JavaScript {
            message: format!("call arguments must be an array, got {}", other.kind_name()),
        }),
    }
}

/// `{ value }` or `{ error }` produced by `__tether_encode` and `__tether_await`.
pub(crate) fn decode_result(json: &str) -> Settlement {
    let parsed: Json = serde_json::from_str(json).map_err(|error| BridgeError::JavaScript {
        message: format!("malformed script result: {error}"),
    })?;
    if let Some(message) = parsed.get("error").and_then(Json::as_str) {
        return Err(BridgeError::JavaScript {
            message: message.to_string(),
        });
    }
    Ok(parsed.get("value").cloned().map(JsValue::from).unwrap_or_default())
}

pub(crate) fn target(
    module: String,
    kind: &str,
    class: String,
    name: String,
) -> Result<CallTarget, BridgeError> {
    let member = match kind {
        "function" => Member::Function(name),
        "constructor" => Member::Constructor { class },
        "method" => Member::Method { class, name },
        "getter" => Member::Getter { class, name },
        other => {
            return Err(BridgeError::JavaScript {
                message: format!("unknown member kind '{other}'"),
            })
        }
    };
    Ok(CallTarget { module, member })
}

/// Module layout handed to `__tether_install`.
pub(crate) fn exports(modules: &[ModuleExport]) -> Json {
    let constants = |constants: &[(String, JsValue)]| {
        constants
            .iter()
            .map(|(name, value)| json!([name, value.to_json()]))
            .collect::<Vec<_>>()
    };
    Json::Array(
        modules
            .iter()
            .map(|module| {
                json!({
                    "name": module.name,
                    "functions": module.functions.iter()
                        .map(|f| json!({ "name": f.name, "arity": f.arity }))
                        .collect::<Vec<_>>(),
                    "constants": constants(&module.constants),
                    "classes": module.classes.iter()
                        .map(|class| json!({
                            "name": class.name,
                            "hasConstructor": class.constructor.is_some(),
                            "methods": class.methods.iter()
                                .map(|m| json!({ "name": m.name, "arity": m.arity }))
                                .collect::<Vec<_>>(),
                            "properties": class.properties,
                            "constants": constants(&class.constants),
                        }))
                        .collect::<Vec<_>>(),
                })
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::ObjectId;

    #[test]
    fn undefined_results_omit_the_value() {
        assert_eq!(settlement(None, &Ok(JsValue::Undefined)), json!({ "status": "ok" }));
        assert_eq!(
            settlement(None, &Ok(JsValue::from(5))),
            json!({ "status": "ok", "value": 5 })
        );
    }

    #[test]
    fn errors_carry_code_and_kind() {
        let error = BridgeError::Arity {
            function: "add".to_string(),
            expected: 2,
            received: 1,
        };
        let encoded = failure(&error);
        assert_eq!(encoded["status"], "error");
        assert_eq!(encoded["error"]["code"], "ERR_INVALID_ARGS_NUMBER");
        assert_eq!(encoded["error"]["kind"], "ArityError");
    }

    #[test]
    fn shared_values_without_a_runtime_have_no_class() {
        let encoded = to_script(None, &JsValue::Shared(ObjectId::from_raw(3)));
        assert_eq!(encoded[OBJECT_ID_KEY], 3);
        assert_eq!(encoded[CLASS_KEY], Json::Null);
    }

    #[test]
    fn arguments_decode_markers() {
        let args = decode_args(r#"[1, {"__tetherObjectId": 9}, null]"#).unwrap();
        assert_eq!(
            args,
            vec![JsValue::from(1), JsValue::Shared(ObjectId::from_raw(9)), JsValue::Null]
        );
        assert!(decode_args("{}").is_err());
    }

    #[test]
    fn results_distinguish_undefined_and_errors() {
        assert_eq!(decode_result("{}").unwrap(), JsValue::Undefined);
        assert_eq!(decode_result(r#"{"value": "x"}"#).unwrap(), JsValue::from("x"));
        assert!(decode_result(r#"{"error": "boom"}"#).is_err());
    }

    #[test]
    fn member_kinds_map_to_targets() {
        let target = target("Demo".into(), "method", "Counter".into(), "increment".into()).unwrap();
        assert_eq!(target, CallTarget::method("Demo", "Counter", "increment"));
        assert!(super::target("Demo".into(), "field", String::new(), String::new()).is_err());
    }
}
