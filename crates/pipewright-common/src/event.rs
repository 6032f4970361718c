use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stage::StagePosition;

/// Version of the push-message contract. Bumped whenever a category is added
/// or a field changes meaning.
pub const PROTOCOL_VERSION: u32 = 1;

/// Closed set of push-message categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    #[serde(rename = "status_update")]
    StatusUpdate,
    #[serde(rename = "log:thinking")]
    LogThinking,
    #[serde(rename = "log:tool_use_pre")]
    LogToolUsePre,
    #[serde(rename = "log:tool_use_post")]
    LogToolUsePost,
    #[serde(rename = "log:file_changed")]
    LogFileChanged,
    #[serde(rename = "log:text")]
    LogText,
    #[serde(rename = "stage_transition")]
    StageTransition,
    #[serde(rename = "completion")]
    Completion,
    #[serde(rename = "error")]
    Error,
}

impl EventCategory {
    pub const ALL: [EventCategory; 9] = [
        EventCategory::StatusUpdate,
        EventCategory::LogThinking,
        EventCategory::LogToolUsePre,
        EventCategory::LogToolUsePost,
        EventCategory::LogFileChanged,
        EventCategory::LogText,
        EventCategory::StageTransition,
        EventCategory::Completion,
        EventCategory::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusUpdate => "status_update",
            Self::LogThinking => "log:thinking",
            Self::LogToolUsePre => "log:tool_use_pre",
            Self::LogToolUsePost => "log:tool_use_post",
            Self::LogFileChanged => "log:file_changed",
            Self::LogText => "log:text",
            Self::StageTransition => "stage_transition",
            Self::Completion => "completion",
            Self::Error => "error",
        }
    }

    pub fn is_log(&self) -> bool {
        self.as_str().starts_with("log:")
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("Unknown event category: {}", s))
    }
}

/// Category of a parsed agent log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    Thinking,
    ToolUsePre,
    ToolUsePost,
    FileChanged,
    Text,
    Status,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thinking => "thinking",
            Self::ToolUsePre => "tool_use_pre",
            Self::ToolUsePost => "tool_use_post",
            Self::FileChanged => "file_changed",
            Self::Text => "text",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thinking" => Ok(Self::Thinking),
            "tool_use_pre" => Ok(Self::ToolUsePre),
            "tool_use_post" => Ok(Self::ToolUsePost),
            "file_changed" => Ok(Self::FileChanged),
            "text" => Ok(Self::Text),
            "status" => Ok(Self::Status),
            _ => Err(format!("Invalid log category: {}", s)),
        }
    }
}

impl From<LogCategory> for EventCategory {
    fn from(category: LogCategory) -> Self {
        match category {
            LogCategory::Thinking => Self::LogThinking,
            LogCategory::ToolUsePre => Self::LogToolUsePre,
            LogCategory::ToolUsePost => Self::LogToolUsePost,
            LogCategory::FileChanged => Self::LogFileChanged,
            LogCategory::Text => Self::LogText,
            // Agent-reported status lines ride the generic status channel.
            LogCategory::Status => Self::StatusUpdate,
        }
    }
}

/// One message on the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub v: u32,
    /// Per-instance log sequence number; present only on log-derived messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub instance_id: String,
    pub category: EventCategory,
    pub stage: Option<StagePosition>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl PushMessage {
    pub fn new(
        instance_id: impl Into<String>,
        category: EventCategory,
        stage: Option<StagePosition>,
        payload: Value,
    ) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            seq: None,
            instance_id: instance_id.into(),
            category,
            stage,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }
}

/// Result of decoding a raw push frame on the subscriber side.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Known(PushMessage),
    /// A well-formed frame whose category this build does not know.
    Unrecognized {
        category: String,
        instance_id: Option<String>,
        version: Option<u64>,
    },
}

/// Decode a raw JSON frame. Unknown categories are inert: they are logged and
/// returned as [`Decoded::Unrecognized`] rather than treated as errors.
pub fn decode(text: &str) -> Result<Decoded, serde_json::Error> {
    let raw: Value = serde_json::from_str(text)?;
    let category = raw
        .get("category")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if category.parse::<EventCategory>().is_err() {
        let instance_id = raw
            .get("instance_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let version = raw.get("v").and_then(Value::as_u64);
        tracing::warn!(
            category = %category,
            instance_id = instance_id.as_deref().unwrap_or("-"),
            version = ?version,
            local_version = PROTOCOL_VERSION,
            "ignoring push message with unrecognized category"
        );
        return Ok(Decoded::Unrecognized {
            category,
            instance_id,
            version,
        });
    }

    serde_json::from_value(raw).map(Decoded::Known)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::Stage;

    #[test]
    fn test_category_wire_names() {
        for category in EventCategory::ALL {
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", category.as_str()));
            assert_eq!(category.as_str().parse::<EventCategory>().unwrap(), category);
        }
    }

    #[test]
    fn test_log_category_maps_to_log_events() {
        assert_eq!(
            EventCategory::from(LogCategory::ToolUsePre),
            EventCategory::LogToolUsePre
        );
        assert!(EventCategory::from(LogCategory::FileChanged).is_log());
        assert!(!EventCategory::from(LogCategory::Status).is_log());
    }

    #[test]
    fn test_push_message_shape() {
        let msg = PushMessage::new(
            "wf-1",
            EventCategory::StageTransition,
            Some(StagePosition::At(Stage::Build)),
            serde_json::json!({"from": "plan", "to": "build"}),
        );
        let value: Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["v"], PROTOCOL_VERSION);
        assert_eq!(value["instance_id"], "wf-1");
        assert_eq!(value["category"], "stage_transition");
        assert_eq!(value["stage"], "build");
        assert!(value.get("timestamp").is_some());
        assert!(value.get("seq").is_none());
    }

    #[test]
    fn test_decode_known_message() {
        let msg = PushMessage::new("wf-2", EventCategory::LogText, None, serde_json::json!("hi"))
            .with_seq(7);
        let text = serde_json::to_string(&msg).unwrap();
        match decode(&text).unwrap() {
            Decoded::Known(decoded) => assert_eq!(decoded, msg),
            other => panic!("Expected Known, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_category_is_inert() {
        let text = r#"{"v":2,"instance_id":"wf-3","category":"log:hologram","stage":null,"payload":{},"timestamp":"2026-01-01T00:00:00Z"}"#;
        match decode(text).unwrap() {
            Decoded::Unrecognized {
                category,
                instance_id,
                version,
            } => {
                assert_eq!(category, "log:hologram");
                assert_eq!(instance_id.as_deref(), Some("wf-3"));
                assert_eq!(version, Some(2));
            }
            other => panic!("Expected Unrecognized, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_malformed_json_is_error() {
        assert!(decode("{not json").is_err());
    }
}
