//! Validation of documents against a collection's JSON schema.
//!
//! Covers the keywords collections use in practice: `type`, `enum`, `const`, `required`,
//! `properties`, `additionalProperties`, `items`, string and array length bounds, numeric
//! bounds and `pattern`. Unknown keywords are ignored.
use regex::Regex;
use serde_json::{Map, Value};

/// Validate `value` against `schema`, returning one message per violation.
pub fn validate(schema: &Value, value: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    check(schema, value, "", &mut errors);
    errors
}

fn type_matches(name: &str, value: &Value) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        _ => true,
    }
}

fn location(path: &str) -> &str {
    if path.is_empty() { "/" } else { path }
}

fn check(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        if schema == &Value::Bool(false) {
            errors.push(format!("{}: value is not allowed", location(path)));
        }
        return;
    };

    if let Some(expected) = schema.get("type") {
        let names: Vec<&str> = match expected {
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !names.is_empty() && !names.iter().any(|n| type_matches(n, value)) {
            errors.push(format!(
                "{}: expected {}, got {}",
                location(path),
                names.join(" or "),
                kind_of(value)
            ));
            return;
        }
    }
    if let Some(Value::Array(options)) = schema.get("enum")
        && !options.contains(value)
    {
        errors.push(format!("{}: value must be one of {}", location(path), Value::Array(options.clone())));
    }
    if let Some(expected) = schema.get("const")
        && expected != value
    {
        errors.push(format!("{}: value must be {expected}", location(path)));
    }

    match value {
        Value::Object(map) => check_object(schema, map, path, errors),
        Value::Array(items) => {
            bound(schema, "minItems", "maxItems", items.len(), path, "items", errors);
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{path}/{i}"), errors);
                }
            }
        }
        Value::String(s) => {
            bound(schema, "minLength", "maxLength", s.chars().count(), path, "characters", errors);
            if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
                match Regex::new(pattern) {
                    Ok(re) if !re.is_match(s) => errors.push(format!(
                        "{}: does not match pattern {pattern}",
                        location(path)
                    )),
                    Ok(_) => {}
                    Err(e) => errors.push(format!("{}: invalid pattern: {e}", location(path))),
                }
            }
        }
        Value::Number(n) => {
            if let Some(n) = n.as_f64() {
                if let Some(min) = schema.get("minimum").and_then(Value::as_f64)
                    && n < min
                {
                    errors.push(format!("{}: must be >= {min}", location(path)));
                }
                if let Some(max) = schema.get("maximum").and_then(Value::as_f64)
                    && n > max
                {
                    errors.push(format!("{}: must be <= {max}", location(path)));
                }
            }
        }
        _ => {}
    }
}

fn check_object(
    schema: &Map<String, Value>,
    map: &Map<String, Value>,
    path: &str,
    errors: &mut Vec<String>,
) {
    if let Some(Value::Array(required)) = schema.get("required") {
        for name in required.iter().filter_map(Value::as_str) {
            if !map.contains_key(name) {
                errors.push(format!("{}: missing property '{name}'", location(path)));
            }
        }
    }
    let properties = schema.get("properties").and_then(Value::as_object);
    for (name, field) in map {
        let child = format!("{path}/{name}");
        match properties.and_then(|p| p.get(name)) {
            Some(field_schema) => check(field_schema, field, &child, errors),
            None => match schema.get("additionalProperties") {
                Some(Value::Bool(false)) => errors.push(format!(
                    "{}: additional property '{name}' is not allowed",
                    location(path)
                )),
                Some(extra @ Value::Object(_)) => check(extra, field, &child, errors),
                _ => {}
            },
        }
    }
}

fn bound(
    schema: &Map<String, Value>,
    min_key: &str,
    max_key: &str,
    len: usize,
    path: &str,
    unit: &str,
    errors: &mut Vec<String>,
) {
    if let Some(min) = schema.get(min_key).and_then(Value::as_u64)
        && (len as u64) < min
    {
        errors.push(format!("{}: needs at least {min} {unit}", location(path)));
    }
    if let Some(max) = schema.get(max_key).and_then(Value::as_u64)
        && (len as u64) > max
    {
        errors.push(format!("{}: allows at most {max} {unit}", location(path)));
    }
}

fn kind_of(value: &Value) -> &'static str {
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
    use serde_json::json;

    use super::*;

    fn user_schema() -> Value {
        json!({
            "type": "object",
            "required": ["name", "age"],
            "properties": {
                "name": {"type": "string", "minLength": 1},
                "age": {"type": "integer", "minimum": 0},
                "role": {"enum": ["admin", "user"]},
                "tags": {"type": "array", "items": {"type": "string"}, "maxItems": 2}
            },
            "additionalProperties": false
        })
    }

    #[test]
    fn test_valid_document() {
        let doc = json!({"name": "ada", "age": 36, "role": "admin", "tags": ["x"]});
        assert!(validate(&user_schema(), &doc).is_empty());
    }

    #[test]
    fn test_violations_are_reported_with_paths() {
        let doc = json!({"name": "", "age": -1, "role": "root", "tags": ["a", 2, "c"], "extra": 1});
        let errors = validate(&user_schema(), &doc);
        assert!(errors.iter().any(|e| e.starts_with("/name:")), "{errors:?}");
        assert!(errors.iter().any(|e| e.starts_with("/age:")));
        assert!(errors.iter().any(|e| e.starts_with("/role:")));
        assert!(errors.iter().any(|e| e == "/tags/1: expected string, got number"));
        assert!(errors.iter().any(|e| e.contains("at most 2 items")));
        assert!(errors.iter().any(|e| e.contains("'extra'")));
    }

    #[test]
    fn test_missing_required_and_wrong_root_type() {
        let errors = validate(&user_schema(), &json!({"name": "x"}));
        assert_eq!(errors, vec!["/: missing property 'age'".to_string()]);

        let errors = validate(&user_schema(), &json!([1]));
        assert_eq!(errors, vec!["/: expected object, got array".to_string()]);
    }
}
