//! Wire formats: inbound commands, outbound acknowledgements and
//! reconciler notifications. All bodies are JSON.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Start,
    Stop,
    Pause,
    Remove,
}

/// A lifecycle command for one device.
#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    pub action: Action,
    pub device_id: i64,
    #[serde(default)]
    pub device_stream_url: Option<String>,
}

/// Commands that cannot be decoded are acked and dropped; poison never
/// requeues.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed command: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("START command without device_stream_url")]
    MissingStreamUrl,
}

pub fn decode_command(body: &[u8]) -> Result<Command, CodecError> {
    let command: Command = serde_json::from_slice(body)?;
    if command.action == Action::Start && command.device_stream_url.is_none() {
        return Err(CodecError::MissingStreamUrl);
    }
    Ok(command)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    Ok,
    BadRequest,
    NotFound,
    Conflict,
    InternalError,
    InconsistentContainerState,
}

impl AckCode {
    pub fn code(self) -> u16 {
        match self {
            AckCode::Ok => 2000,
            AckCode::BadRequest => 4000,
            AckCode::NotFound => 4004,
            AckCode::Conflict => 4009,
            AckCode::InternalError => 5000,
            AckCode::InconsistentContainerState => 5001,
        }
    }
}

/// Acknowledgement for one processed command.
#[derive(Debug, Clone, Serialize)]
pub struct Ack {
    pub device_id: i64,
    pub action: Action,
    pub code: u16,
    pub message: String,
}

impl Ack {
    pub fn new(device_id: i64, action: Action, code: AckCode, message: impl Into<String>) -> Self {
        Ack {
            device_id,
            action,
            code: code.code(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationAction {
    UpdatedInstance,
    RemovedInstance,
}

impl NotificationAction {
    pub fn code(self) -> u16 {
        match self {
            NotificationAction::UpdatedInstance => 3001,
            NotificationAction::RemovedInstance => 3002,
        }
    }
}

/// Batched reconciler notification: one message per pass per category,
/// never one per instance.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub device_ids: Vec<i64>,
    pub action: NotificationAction,
    pub code: u16,
    pub message: String,
}

impl Notification {
    pub fn new(
        action: NotificationAction,
        device_ids: Vec<i64>,
        message: impl Into<String>,
    ) -> Self {
        Notification {
            device_ids,
            action,
            code: action.code(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_start_command() {
        let body = br#"{"action":"START","device_id":42,"device_stream_url":"rtsp://a/s"}"#;
        let command = decode_command(body).unwrap();
        assert_eq!(command.action, Action::Start);
        assert_eq!(command.device_id, 42);
        assert_eq!(command.device_stream_url.as_deref(), Some("rtsp://a/s"));
    }

    #[test]
    fn stream_url_is_optional_except_for_start() {
        let stop = decode_command(br#"{"action":"STOP","device_id":7}"#).unwrap();
        assert_eq!(stop.action, Action::Stop);
        assert!(stop.device_stream_url.is_none());

        let err = decode_command(br#"{"action":"START","device_id":7}"#).unwrap_err();
        assert!(matches!(err, CodecError::MissingStreamUrl));
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(decode_command(b"not json").is_err());
        assert!(decode_command(br#"{"device_id":1}"#).is_err());
        assert!(decode_command(br#"{"action":"RESTART","device_id":1}"#).is_err());
        assert!(decode_command(br#"{"action":"STOP","device_id":"one"}"#).is_err());
    }

    #[test]
    fn ack_code_map_is_exhaustive() {
        assert_eq!(AckCode::Ok.code(), 2000);
        assert_eq!(AckCode::BadRequest.code(), 4000);
        assert_eq!(AckCode::NotFound.code(), 4004);
        assert_eq!(AckCode::Conflict.code(), 4009);
        assert_eq!(AckCode::InternalError.code(), 5000);
        assert_eq!(AckCode::InconsistentContainerState.code(), 5001);
    }

    #[test]
    fn serializes_ack() {
        let ack = Ack::new(42, Action::Start, AckCode::Ok, "OK");
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"device_id": 42, "action": "START", "code": 2000, "message": "OK"})
        );
    }

    #[test]
    fn serializes_notification() {
        let updated = Notification::new(
            NotificationAction::UpdatedInstance,
            vec![42],
            "containers exited",
        );
        assert_eq!(
            serde_json::to_value(&updated).unwrap(),
            json!({
                "device_ids": [42],
                "action": "UPDATED_INSTANCE",
                "code": 3001,
                "message": "containers exited"
            })
        );

        let removed = Notification::new(NotificationAction::RemovedInstance, vec![99, 100], "gone");
        let value = serde_json::to_value(&removed).unwrap();
        assert_eq!(value["action"], "REMOVED_INSTANCE");
        assert_eq!(value["code"], 3002);
    }
}
