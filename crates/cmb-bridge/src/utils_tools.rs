//! Built-in `utils` virtual namespace, registered through the upstream
//! manager's virtual-server path.

use std::sync::Arc;

use anyhow::bail;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use cmb_protocol::HostCallable;
use cmb_upstream::ToolDescriptor;
use serde_json::{Value, json};

pub const UTILS_NAMESPACE: &str = "utils";

pub fn utils_descriptors() -> Vec<ToolDescriptor> {
    vec![
        descriptor(
            "base64_encode",
            "Encode a UTF-8 string as base64",
            json!({
                "type": "object",
                "properties": {"text": {"type": "string", "description": "Text to encode"}},
                "required": ["text"],
            }),
            Arc::new(|args: Vec<Value>| {
                Box::pin(async move {
                    let text = required_str(&args, "text")?;
                    Ok(json!(BASE64_STANDARD.encode(text.as_bytes())))
                })
            }),
        ),
        descriptor(
            "base64_decode",
            "Decode base64 into a UTF-8 string",
            json!({
                "type": "object",
                "properties": {"data": {"type": "string", "description": "Base64 payload"}},
                "required": ["data"],
            }),
            Arc::new(|args: Vec<Value>| {
                Box::pin(async move {
                    let data = required_str(&args, "data")?;
                    let bytes = BASE64_STANDARD.decode(data.as_bytes())?;
                    Ok(json!(String::from_utf8_lossy(&bytes).into_owned()))
                })
            }),
        ),
        descriptor(
            "timestamp",
            "Current UTC time as an RFC3339 string",
            json!({"type": "object", "properties": {}}),
            Arc::new(|_args: Vec<Value>| {
                Box::pin(async move { Ok(json!(chrono::Utc::now().to_rfc3339())) })
            }),
        ),
    ]
}

fn descriptor(name: &str, description: &str, schema: Value, execute: HostCallable) -> ToolDescriptor {
    ToolDescriptor {
        name: name.to_string(),
        upstream_name: name.to_string(),
        description: description.to_string(),
        raw_schema: schema.clone(),
        input_schema: schema,
        output_schema: None,
        execute,
    }
}

fn required_str(args: &[Value], key: &str) -> anyhow::Result<String> {
    let Some(value) = args.first().and_then(|arg| arg.get(key)).and_then(Value::as_str) else {
        bail!("missing required argument: {key}");
    };
    Ok(value.to_string())
}
