use serde_json::Value;

const MAX_DEPTH: usize = 6;

/// Render a TypeScript-style declaration snippet for one tool from its raw
/// JSON Schema, e.g.
/// `function github__create_release(args: { tag: string; draft?: boolean }): Promise<unknown>`.
///
/// Best-effort: schemas that cannot be interpreted render as `unknown`
/// parameters rather than failing.
pub fn render_declaration(name: &str, raw_schema: &Value) -> String {
    let args = render_type(raw_schema, 0);
    format!("function {name}(args: {args}): Promise<unknown>")
}

fn render_type(schema: &Value, depth: usize) -> String {
    if depth >= MAX_DEPTH {
        return "unknown".to_string();
    }
    let Value::Object(map) = schema else {
        return "unknown".to_string();
    };

    if let Some(Value::Array(options)) = map.get("enum") {
        let literals: Vec<String> = options.iter().map(render_literal).collect();
        if !literals.is_empty() {
            return literals.join(" | ");
        }
    }

    for key in ["oneOf", "anyOf"] {
        if let Some(Value::Array(options)) = map.get(key) {
            let rendered: Vec<String> =
                options.iter().map(|s| render_type(s, depth + 1)).collect();
            if !rendered.is_empty() {
                return rendered.join(" | ");
            }
        }
    }

    match map.get("type").and_then(Value::as_str) {
        Some("string") => "string".to_string(),
        Some("number") | Some("integer") => "number".to_string(),
        Some("boolean") => "boolean".to_string(),
        Some("null") => "null".to_string(),
        Some("array") => {
            let items = map.get("items").map_or("unknown".to_string(), |s| {
                render_type(s, depth + 1)
            });
            if items.contains(' ') {
                format!("({items})[]")
            } else {
                format!("{items}[]")
            }
        }
        Some("object") | None if map.contains_key("properties") => {
            render_object(map, depth)
        }
        Some("object") => "Record<string, unknown>".to_string(),
        _ => "unknown".to_string(),
    }
}

fn render_object(map: &serde_json::Map<String, Value>, depth: usize) -> String {
    let Some(Value::Object(properties)) = map.get("properties") else {
        return "Record<string, unknown>".to_string();
    };
    if properties.is_empty() {
        return "Record<string, unknown>".to_string();
    }

    let required: Vec<&str> = map
        .get("required")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let fields: Vec<String> = properties
        .iter()
        .map(|(key, prop)| {
            let optional = if required.contains(&key.as_str()) { "" } else { "?" };
            format!("{key}{optional}: {}", render_type(prop, depth + 1))
        })
        .collect();

    format!("{{ {} }}", fields.join("; "))
}

fn render_literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!("{s:?}"),
        other => other.to_string(),
    }
}
