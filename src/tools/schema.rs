//! Minimal JSON Schema argument checking.
//!
//! Covers the subset tool schemas actually use: object payloads, required
//! fields, primitive types, and enum constraints. Anything the schema does
//! not constrain passes.

use serde_json::Value;

/// Check `args` against a JSON Schema fragment. Returns the first problem
/// found as a human-readable message.
pub fn check_args(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(obj) = args.as_object() else {
        return Err(format!(
            "arguments must be a JSON object, got {}",
            type_name(args)
        ));
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if !obj.contains_key(field) {
                return Err(format!("missing required field '{field}'"));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return Ok(());
    };

    for (name, prop_schema) in properties {
        let Some(value) = obj.get(name) else { continue };

        if let Some(expected) = prop_schema.get("type").and_then(|t| t.as_str()) {
            if !type_matches(expected, value) {
                return Err(format!(
                    "field '{name}' should be {expected}, got {}",
                    type_name(value)
                ));
            }
        }

        if let Some(allowed) = prop_schema.get("enum").and_then(|e| e.as_array()) {
            if !allowed.contains(value) {
                return Err(format!("field '{name}' must be one of {allowed:?}"));
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn code_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": { "type": "string" },
                "timeout_secs": { "type": "integer" },
                "language": { "type": "string", "enum": ["python"] }
            },
            "required": ["code"]
        })
    }

    #[test]
    fn test_valid_args() {
        let args = json!({"code": "x = 1", "timeout_secs": 5});
        assert!(check_args(&code_schema(), &args).is_ok());
    }

    #[test]
    fn test_non_object_payload() {
        let err = check_args(&code_schema(), &json!("just a string")).unwrap_err();
        assert!(err.contains("object"));
    }

    #[test]
    fn test_missing_required() {
        let err = check_args(&code_schema(), &json!({})).unwrap_err();
        assert!(err.contains("code"));
    }

    #[test]
    fn test_wrong_type() {
        let err = check_args(&code_schema(), &json!({"code": 42})).unwrap_err();
        assert!(err.contains("string"));
    }

    #[test]
    fn test_enum_violation() {
        let args = json!({"code": "1", "language": "ruby"});
        let err = check_args(&code_schema(), &args).unwrap_err();
        assert!(err.contains("language"));
    }

    #[test]
    fn test_unconstrained_extra_field_passes() {
        let args = json!({"code": "1", "unexpected": true});
        assert!(check_args(&code_schema(), &args).is_ok());
    }
}
