//! Run records and the output of finished states.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

pub const STATUS_ACTIVE: &str = "ACTIVE";
pub const STATUS_SUCCEEDED: &str = "SUCCEEDED";
pub const STATUS_FAILED: &str = "FAILED";

/// What the flow service reports about one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(alias = "action_id")]
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub details: Value,
}

impl RunRecord {
    pub fn new(run_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            flow_id: None,
            status: status.into(),
            display_status: None,
            label: None,
            tags: Vec::new(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status == STATUS_SUCCEEDED || self.status == STATUS_FAILED
    }

    pub fn succeeded(&self) -> bool {
        self.status == STATUS_SUCCEEDED
    }

    pub fn failed(&self) -> bool {
        self.status == STATUS_FAILED
    }

    /// Why the run failed, as reported by the flow service.
    pub fn description(&self) -> String {
        self.details
            .get("description")
            .and_then(Value::as_str)
            .or(self.display_status.as_deref())
            .unwrap_or(self.status.as_str())
            .to_string()
    }

    /// The `details` a state wrote into the run output, with any remote
    /// exceptions turned into readable tracebacks.
    pub fn state_details(&self, state: &str) -> Result<Value> {
        let output = self
            .details
            .get("output")
            .and_then(|output| output.get(state))
            .ok_or_else(|| {
                Error::NotFound(format!("run {} has no output for state '{state}'", self.run_id))
            })?;

        let mut details = output.get("details").cloned().unwrap_or_else(|| output.clone());
        decode_exceptions(&mut details);
        Ok(details)
    }
}

/// Replace every `exception` field below `value` with a traceback string.
pub fn decode_exceptions(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if let Some(exception) = map.get_mut("exception") {
                *exception = Value::String(render_exception(exception));
            }
            for (key, item) in map.iter_mut() {
                if key != "exception" {
                    decode_exceptions(item);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(decode_exceptions),
        _ => {}
    }
}

/// Render one remote exception.
///
/// Accepts a structured object (`exc_type`/`type`, `message`, `traceback`),
/// a `00\n<json>` string, or a `01\n<base64 json>` string. Anything else is
/// returned as text.
pub fn render_exception(exception: &Value) -> String {
    match exception {
        Value::Object(map) => render_structured(map),
        Value::String(text) => {
            if let Some(json) = text.strip_prefix("00\n") {
                if let Ok(inner) = serde_json::from_str::<Value>(json) {
                    return render_exception(&inner);
                }
            }
            if let Some(encoded) = text.strip_prefix("01\n") {
                let decoded = STANDARD
                    .decode(encoded.trim())
                    .ok()
                    .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok());
                if let Some(inner) = decoded {
                    return render_exception(&inner);
                }
            }
            text.clone()
        }
        other => other.to_string(),
    }
}

fn render_structured(map: &Map<String, Value>) -> String {
    let text = |key: &str| map.get(key).and_then(Value::as_str);
    let kind = text("exc_type").or_else(|| text("type")).unwrap_or("Exception");
    let message = text("message").unwrap_or_default();

    let mut rendered = String::new();
    if let Some(traceback) = text("traceback") {
        rendered.push_str(traceback.trim_end());
        rendered.push('\n');
    }
    rendered.push_str(kind);
    if !message.is_empty() {
        rendered.push_str(": ");
        rendered.push_str(message);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunRecord::new("r", STATUS_ACTIVE).is_terminal());
        assert!(RunRecord::new("r", STATUS_SUCCEEDED).is_terminal());
        assert!(RunRecord::new("r", STATUS_FAILED).failed());
    }

    #[test]
    fn test_action_id_alias() {
        let record: RunRecord =
            serde_json::from_value(json!({"action_id": "abc", "status": "ACTIVE"})).unwrap();
        assert_eq!(record.run_id, "abc");
    }

    #[test]
    fn test_state_details() {
        let record = RunRecord::new("r", STATUS_SUCCEEDED).with_details(json!({
            "output": {"Hello": {"details": {"result": "hi"}}}
        }));
        assert_eq!(record.state_details("Hello").unwrap(), json!({"result": "hi"}));
        assert!(record.state_details("Missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_structured_exception() {
        let mut details = json!({"results": [{"exception": {
            "exc_type": "ValueError",
            "message": "bad input",
            "traceback": "Traceback (most recent call last):\n  File \"x\", line 1\n"
        }}]});
        decode_exceptions(&mut details);
        assert_eq!(
            details["results"][0]["exception"],
            "Traceback (most recent call last):\n  File \"x\", line 1\nValueError: bad input"
        );
    }

    #[test]
    fn test_encoded_exceptions() {
        let inner = json!({"type": "KeyError", "message": "'x'"}).to_string();
        assert_eq!(render_exception(&json!(format!("00\n{inner}"))), "KeyError: 'x'");

        let encoded = STANDARD.encode(inner.as_bytes());
        assert_eq!(render_exception(&json!(format!("01\n{encoded}"))), "KeyError: 'x'");

        assert_eq!(render_exception(&json!("plain failure")), "plain failure");
    }
}
