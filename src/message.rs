//! Message protocol definitions
//!
//! One JSON envelope per WebSocket frame in both directions:
//! `{"Type": <int>, "User": {"Name": .., "Email": ..}, "Text": ..}`.
//! The kind is a stable small integer rather than a string tag so that
//! existing browser clients keep working.

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Protocol event kind, encoded on the wire as an integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageKind {
    /// Client asks to enter the room (`Text` carries `name` or `name\nemail`)
    Hello = 0,
    /// Regular chat text, both directions
    Text = 1,
    /// Client redeems a login code (`Text` carries the code)
    Auth = 2,
    /// Server accepted the client into the room
    AuthAck = 3,
    /// Server rejected a login code
    AuthReject = 4,
    /// Server refused entry (name held by someone else)
    EntryRejected = 5,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Hello),
            1 => Ok(Self::Text),
            2 => Ok(Self::Auth),
            3 => Ok(Self::AuthAck),
            4 => Ok(Self::AuthReject),
            5 => Ok(Self::EntryRejected),
            other => Err(format!("unknown message type {}", other)),
        }
    }
}

/// Chat identity
///
/// Room membership is keyed by the lowercased name. An empty email
/// means none was supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct User {
    pub name: String,
    pub email: String,
}

impl User {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// Case-insensitive key used for name reservation
    pub fn name_key(&self) -> String {
        self.name.to_lowercase()
    }

    pub fn has_email(&self) -> bool {
        !self.email.is_empty()
    }
}

/// Protocol envelope exchanged with clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "Type")]
    pub kind: MessageKind,
    #[serde(rename = "User", default)]
    pub user: User,
    #[serde(rename = "Text", default)]
    pub text: String,
}

impl Message {
    pub fn new(kind: MessageKind, user: User, text: impl Into<String>) -> Self {
        Self {
            kind,
            user,
            text: text.into(),
        }
    }

    /// Chat text attributed to `user`
    pub fn text(user: User, text: impl Into<String>) -> Self {
        Self::new(MessageKind::Text, user, text)
    }

    /// Control message with an empty text payload
    pub fn control(kind: MessageKind, user: User) -> Self {
        Self::new(kind, user, String::new())
    }

    /// Decode one inbound frame
    pub fn from_json(text: &str) -> Result<Self, AppError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frame queued for a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Protocol message, serialized to a JSON text frame
    Message(Message),
    /// Keepalive ping
    Ping,
}

impl From<Message> for Outbound {
    fn from(msg: Message) -> Self {
        Outbound::Message(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_deserialize() {
        let json = r#"{"Type": 0, "User": {"Name": "", "Email": ""}, "Text": "alice\na@x.com"}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.kind, MessageKind::Hello);
        assert_eq!(msg.text, "alice\na@x.com");
    }

    #[test]
    fn test_message_deserialize_missing_fields() {
        let json = r#"{"Type": 2, "Text": "ab12cd"}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.kind, MessageKind::Auth);
        assert_eq!(msg.user, User::default());
    }

    #[test]
    fn test_message_serialize() {
        let msg = Message::text(User::new("bot", "bot@chat"), "hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"Type\":1"));
        assert!(json.contains("\"User\":{\"Name\":\"bot\",\"Email\":\"bot@chat\"}"));
        assert!(json.contains("\"Text\":\"hi\""));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let json = r#"{"Type": 9, "Text": "x"}"#;
        assert!(serde_json::from_str::<Message>(json).is_err());
    }

    #[test]
    fn test_from_json_reports_decode_errors() {
        let msg = Message::from_json(r#"{"Type": 1, "Text": "hi"}"#).unwrap();
        assert_eq!(msg, Message::text(User::default(), "hi"));

        assert!(matches!(Message::from_json("not json"), Err(AppError::Json(_))));
        assert!(matches!(
            Message::from_json(r#"{"Type": 7}"#),
            Err(AppError::Json(_))
        ));
    }

    #[test]
    fn test_outbound_from_message() {
        let msg = Message::control(MessageKind::AuthAck, User::new("alice", ""));
        let frame: Outbound = msg.clone().into();
        assert_eq!(frame, Outbound::Message(msg));
    }

    #[test]
    fn test_name_key_is_lowercase() {
        let user = User::new("Alice", "");
        assert_eq!(user.name_key(), "alice");
        assert!(!user.has_email());
    }
}
