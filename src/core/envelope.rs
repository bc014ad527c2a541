use serde::{Deserialize, Serialize};
use serde_json::Value;

const ENVELOPE_TYPE: &str = "tool_result";
const ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

/// Structured tool output carried in the `content` string of a `tool_result`
/// chunk. Anything that does not decode as an envelope is an opaque result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolResultEnvelope {
    pub message: Option<String>,
    pub artifacts: Option<Vec<ArtifactRef>>,
    /// JSON `null` is treated as absent.
    pub data: Option<Value>,
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    artifacts: Option<Vec<ArtifactRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl ToolResultEnvelope {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_artifact(mut self, artifact: ArtifactRef) -> Self {
        self.artifacts.get_or_insert_with(Vec::new).push(artifact);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = (!data.is_null()).then_some(data);
        self
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&WireEnvelope {
            kind: ENVELOPE_TYPE.to_string(),
            version: ENVELOPE_VERSION,
            message: self.message.clone(),
            artifacts: self.artifacts.clone(),
            data: self.data.clone().filter(|d| !d.is_null()),
        })
    }

    /// Returns `None` for anything that is not a version-1 tool result
    /// envelope, including non-JSON input.
    pub fn decode(content: &str) -> Option<Self> {
        let wire: WireEnvelope = serde_json::from_str(content).ok()?;
        if wire.kind != ENVELOPE_TYPE || wire.version != ENVELOPE_VERSION {
            return None;
        }
        Some(Self {
            message: wire.message,
            artifacts: wire.artifacts,
            data: wire.data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_survives_encoding() {
        let env = ToolResultEnvelope::message("Query returned 42 rows")
            .with_artifact(ArtifactRef {
                id: "a1".into(),
                kind: Some("table".into()),
                row_count: Some(42),
            })
            .with_data(json!({"columns": ["id", "name"]}));
        let encoded = env.encode().unwrap();
        let v: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(v["type"], "tool_result");
        assert_eq!(v["version"], 1);
        assert_eq!(v["artifacts"][0]["row_count"], 42);
        assert_eq!(ToolResultEnvelope::decode(&encoded), Some(env));
    }

    #[test]
    fn minimal_envelope_omits_optional_fields() {
        let encoded = ToolResultEnvelope::message("ok").encode().unwrap();
        let v: Value = serde_json::from_str(&encoded).unwrap();
        assert!(v.get("artifacts").is_none());
        assert!(v.get("data").is_none());
    }

    #[test]
    fn null_data_is_absent() {
        let env = ToolResultEnvelope::message("ok").with_data(Value::Null);
        assert_eq!(env.data, None);
        assert_eq!(ToolResultEnvelope::decode(&env.encode().unwrap()), Some(env));

        let set_directly = ToolResultEnvelope {
            data: Some(Value::Null),
            ..ToolResultEnvelope::message("ok")
        };
        let encoded = set_directly.encode().unwrap();
        let v: Value = serde_json::from_str(&encoded).unwrap();
        assert!(v.get("data").is_none());
        assert_eq!(
            ToolResultEnvelope::decode(&encoded),
            Some(ToolResultEnvelope::message("ok"))
        );
    }

    #[test]
    fn foreign_content_is_opaque() {
        assert_eq!(ToolResultEnvelope::decode("plain text output"), None);
        assert_eq!(ToolResultEnvelope::decode("{\"success\":true}"), None);
        assert_eq!(
            ToolResultEnvelope::decode("{\"type\":\"tool_result\",\"version\":2}"),
            None
        );
        assert_eq!(
            ToolResultEnvelope::decode("{\"type\":\"other\",\"version\":1}"),
            None
        );
        assert_eq!(ToolResultEnvelope::decode("[1,2,3]"), None);
        assert!(ToolResultEnvelope::decode("{\"type\":\"tool_result\",\"version\":1}").is_some());
    }
}
