use serde_json::Value;

const COMBINATOR_KEYS: [&str; 3] = ["anyOf", "allOf", "oneOf"];

/// Return a copy of `schema` with `format: "uri"` removed from string nodes.
///
/// Some chat-completions backends reject that keyword in tool parameters.
/// Everything else is left untouched, so the function is idempotent.
#[must_use]
pub fn sanitize_schema(schema: &Value) -> Value {
    let mut out = schema.clone();
    sanitize_schema_in_place(&mut out);
    out
}

/// In-place variant of [`sanitize_schema`].
pub fn sanitize_schema_in_place(schema: &mut Value) {
    match schema {
        Value::Array(items) => items.iter_mut().for_each(sanitize_schema_in_place),
        Value::Object(_) => sanitize_node(schema),
        _ => {}
    }
}

fn sanitize_node(node: &mut Value) {
    let Some(obj) = node.as_object_mut() else {
        return;
    };

    let is_uri_string = obj.get("type").and_then(Value::as_str) == Some("string")
        && obj.get("format").and_then(Value::as_str) == Some("uri");
    if is_uri_string {
        obj.remove("format");
    }

    if let Some(Value::Object(props)) = obj.get_mut("properties") {
        for prop in props.values_mut() {
            sanitize_node(prop);
        }
    }

    match obj.get_mut("items") {
        Some(items @ Value::Object(_)) => sanitize_node(items),
        // tuple form
        Some(Value::Array(items)) => items.iter_mut().for_each(sanitize_node),
        _ => {}
    }

    if let Some(additional @ Value::Object(_)) = obj.get_mut("additionalProperties") {
        sanitize_node(additional);
    }

    for key in COMBINATOR_KEYS {
        if let Some(Value::Array(variants)) = obj.get_mut(key) {
            variants.iter_mut().for_each(sanitize_node);
        }
    }
}
