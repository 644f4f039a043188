//! JSON extraction and schema validation for structured output.
//!
//! Models often wrap JSON in Markdown fences or prose. [`extract_json`]
//! takes the first balanced JSON value it can parse. [`validate`] checks
//! the subset of JSON Schema the built-in templates use: `type`,
//! `properties`, `required`, `items`, `minItems`, `maxItems`, `enum`,
//! `minimum`, `maximum`, and `additionalProperties: false`.

use serde_json::{json, Value};

/// Pull the first JSON object or array out of model output.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = strip_fences(text.trim());
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() || v.is_array() {
            return Some(v);
        }
    }

    let bytes = trimmed.as_bytes();
    let mut from = 0;
    while let Some(rel) = trimmed[from..].find(|c: char| c == '{' || c == '[') {
        let start = from + rel;
        if let Some(end) = balanced_end(bytes, start) {
            if let Ok(v) = serde_json::from_str::<Value>(&trimmed[start..end]) {
                return Some(v);
            }
        }
        from = start + 1;
    }
    None
}

fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (```json).
    let body = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    match body.rfind("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// Byte index one past the bracket matching the one at `start`.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Validate `value` against `schema`. The error names the failing path.
pub fn validate(value: &Value, schema: &Value) -> Result<(), String> {
    check(value, schema, "$")
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(v: &Value, expected: &str) -> bool {
    match expected {
        "number" => v.is_number(),
        "integer" => {
            v.is_i64() || v.is_u64() || v.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        other => type_name(v) == other,
    }
}

fn check(value: &Value, schema: &Value, path: &str) -> Result<(), String> {
    if let Some(t) = schema.get("type") {
        let allowed: Vec<&str> = match t {
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|a| type_matches(value, a)) {
            return Err(format!(
                "{}: expected {}, got {}",
                path,
                allowed.join(" or "),
                type_name(value)
            ));
        }
    }

    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        if !options.contains(value) {
            return Err(format!("{}: {} is not one of {}", path, value, Value::Array(options.clone())));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                return Err(format!("{}: {} is less than minimum {}", path, n, min));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                return Err(format!("{}: {} is greater than maximum {}", path, n, max));
            }
        }
    }

    if let Value::Array(items) = value {
        if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
            if (items.len() as u64) < min {
                return Err(format!("{}: expected at least {} item(s), got {}", path, min, items.len()));
            }
        }
        if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
            if items.len() as u64 > max {
                return Err(format!("{}: expected at most {} item(s), got {}", path, max, items.len()));
            }
        }
        if let Some(item_schema) = schema.get("items") {
            for (i, item) in items.iter().enumerate() {
                check(item, item_schema, &format!("{}[{}]", path, i))?;
            }
        }
    }

    if let Value::Object(map) = value {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !map.contains_key(key) {
                    return Err(format!("{}: missing required property '{}'", path, key));
                }
            }
        }
        let props = schema.get("properties").and_then(Value::as_object);
        if let Some(props) = props {
            for (key, sub) in props {
                if let Some(v) = map.get(key) {
                    check(v, sub, &format!("{}.{}", path, key))?;
                }
            }
        }
        if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
            if let Some(extra) = map
                .keys()
                .find(|k| props.map_or(true, |p| !p.contains_key(k.as_str())))
            {
                return Err(format!("{}: unexpected property '{}'", path, extra));
            }
        }
    }

    Ok(())
}

/// `{"questions": [string, ...]}`
pub fn questions_schema(max_items: usize) -> Value {
    json!({
        "type": "object",
        "required": ["questions"],
        "properties": {
            "questions": {
                "type": "array",
                "items": {"type": "string"},
                "maxItems": max_items.max(1) * 2
            }
        }
    })
}

/// `{"pairs": [{genre: {title, description}, audience: {title, description}}]}`
pub fn ga_pairs_schema() -> Value {
    let titled = json!({
        "type": "object",
        "required": ["title", "description"],
        "properties": {
            "title": {"type": "string"},
            "description": {"type": "string"}
        }
    });
    json!({
        "type": "object",
        "required": ["pairs"],
        "properties": {
            "pairs": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "required": ["genre", "audience"],
                    "properties": {"genre": titled.clone(), "audience": titled}
                }
            }
        }
    })
}

/// `{"edits": [{id, action, question?, answer?, reason?}]}`
pub fn edits_schema() -> Value {
    json!({
        "type": "object",
        "required": ["edits"],
        "properties": {
            "edits": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["id", "action"],
                    "properties": {
                        "id": {"type": "string"},
                        "action": {"type": "string", "enum": ["accept", "revise", "reject"]},
                        "question": {"type": ["string", "null"]},
                        "answer": {"type": ["string", "null"]},
                        "reason": {"type": ["string", "null"]}
                    }
                }
            }
        }
    })
}

/// `{"score": 0..1, "evaluation": string}`
pub fn evaluation_schema() -> Value {
    json!({
        "type": "object",
        "required": ["score"],
        "properties": {
            "score": {"type": "number", "minimum": 0, "maximum": 1},
            "evaluation": {"type": "string"}
        }
    })
}

/// `{"turns": [{role: user|assistant, content}]}`
pub fn conversation_schema() -> Value {
    json!({
        "type": "object",
        "required": ["turns"],
        "properties": {
            "turns": {
                "type": "array",
                "minItems": 2,
                "items": {
                    "type": "object",
                    "required": ["role", "content"],
                    "properties": {
                        "role": {"type": "string", "enum": ["user", "assistant"]},
                        "content": {"type": "string"}
                    }
                }
            }
        }
    })
}
