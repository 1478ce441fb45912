//! Defensive parsing of raw stream frames.
//!
//! Runs in the background context before anything is forwarded. Bad frames are
//! classified as drops with a reason; they never become connection errors.

use serde_json::Value;
use shared_types::{AgentResponse, LogLevel};

#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Empty or whitespace payload.
    Empty,
    /// Server keep-alive; only refreshes liveness.
    Heartbeat,
    Response(AgentResponse),
    Dropped { level: LogLevel, reason: String },
}

pub fn classify_frame(raw: &str, max_frame_bytes: usize) -> FrameOutcome {
    if raw.trim().is_empty() {
        return FrameOutcome::Empty;
    }
    if raw.len() > max_frame_bytes {
        return dropped(
            LogLevel::Warn,
            format!("frame of {} bytes exceeds {max_frame_bytes}", raw.len()),
        );
    }

    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => return dropped(LogLevel::Warn, format!("frame is not valid JSON: {e}")),
    };
    let Value::Object(obj) = value else {
        return dropped(LogLevel::Warn, "frame is not a JSON object".to_string());
    };

    if obj.get("heartbeat").and_then(Value::as_bool) == Some(true) {
        return FrameOutcome::Heartbeat;
    }

    let message = obj
        .get("message")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    if let Some(patches) = obj.get("patches") {
        let Some(patches) = patches.as_array() else {
            return dropped(LogLevel::Warn, "frame 'patches' is not an array".to_string());
        };
        let Some(request_id) = obj.get("requestId").and_then(Value::as_str) else {
            return dropped(
                LogLevel::Warn,
                "patch frame is missing a string 'requestId'".to_string(),
            );
        };
        return FrameOutcome::Response(AgentResponse {
            patches: Some(patches.clone()),
            message,
            request_id: Some(request_id.to_string()),
            raw_message: raw.to_string(),
        });
    }

    if message.is_some() {
        return FrameOutcome::Response(AgentResponse {
            patches: None,
            message,
            request_id: obj
                .get("requestId")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            raw_message: raw.to_string(),
        });
    }

    dropped(
        LogLevel::Debug,
        "frame carries neither patches nor a message".to_string(),
    )
}

fn dropped(level: LogLevel, reason: String) -> FrameOutcome {
    FrameOutcome::Dropped { level, reason }
}
