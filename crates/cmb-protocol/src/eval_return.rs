use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One validated block of a sandbox script's return value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EvalBlock {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Json {
        value: Value,
    },
}

/// The template shown to scripts that return something unexpected.
const RETURN_TEMPLATE: &str = r#"{type:"text", text:string} | {type:"image", data:base64, mimeType:string} | {type:"audio", data:base64, mimeType:string} | {type:"json", value:any} | an array of those blocks"#;

#[derive(Debug, Error)]
#[error(
    "invalid value returned from sandbox script: received {received}; \
     the script must return {template}",
    template = RETURN_TEMPLATE
)]
pub struct EvalReturnError {
    /// Compact description of what the script actually returned.
    pub received: String,
}

/// Validate a script return value against the block contract.
///
/// Accepts a single block or an array of blocks; anything else is rejected
/// with an error describing the received shape and the required template.
pub fn validate_eval_return(value: &Value) -> Result<Vec<EvalBlock>, EvalReturnError> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(validate_block)
            .collect::<Result<Vec<_>, _>>(),
        other => Ok(vec![validate_block(other)?]),
    }
}

fn validate_block(value: &Value) -> Result<EvalBlock, EvalReturnError> {
    if value.is_object() {
        if let Ok(block) = serde_json::from_value::<EvalBlock>(value.clone()) {
            return Ok(block);
        }
    }
    Err(EvalReturnError {
        received: describe_shape(value),
    })
}

fn describe_shape(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("boolean {b}"),
        Value::Number(n) => format!("number {n}"),
        Value::String(s) => {
            let mut preview: String = s.chars().take(40).collect();
            if preview.len() < s.len() {
                preview.push_str("...");
            }
            format!("string {preview:?}")
        }
        Value::Array(items) => format!("array of {} item(s)", items.len()),
        Value::Object(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).take(8).collect();
            format!("object with keys [{}]", keys.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_text_block() {
        let blocks = validate_eval_return(&json!({"type": "text", "text": "ok"})).unwrap();
        assert_eq!(blocks, vec![EvalBlock::Text { text: "ok".to_string() }]);
    }

    #[test]
    fn accepts_image_with_mime_type() {
        let blocks =
            validate_eval_return(&json!({"type": "image", "data": "aGk=", "mimeType": "image/png"}))
                .unwrap();
        match &blocks[0] {
            EvalBlock::Image { data, mime_type } => {
                assert_eq!(data, "aGk=");
                assert_eq!(mime_type, "image/png");
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn accepts_array_of_blocks() {
        let blocks = validate_eval_return(&json!([
            {"type": "text", "text": "a"},
            {"type": "json", "value": {"n": 1}},
        ]))
        .unwrap();
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn rejects_bare_number_with_template() {
        let err = validate_eval_return(&json!(42)).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("invalid value"), "got: {message}");
        assert!(message.contains("number 42"), "got: {message}");
        assert!(message.contains(r#"{type:"json", value:any}"#), "got: {message}");
    }

    #[test]
    fn rejects_object_with_wrong_keys() {
        let err = validate_eval_return(&json!({"kind": "text"})).unwrap_err();
        assert!(err.to_string().contains("object with keys [kind]"));
    }

    #[test]
    fn rejects_array_with_one_bad_block() {
        let err =
            validate_eval_return(&json!([{"type": "text", "text": "ok"}, null])).unwrap_err();
        assert!(err.to_string().contains("null"));
    }
}
