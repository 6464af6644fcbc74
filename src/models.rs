use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Rails serializes ids as numbers in some payloads and strings in others.
/// Everything is a `String` on this side; these helpers absorb the difference.
pub(crate) fn id_string<'de, D>(de: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(de)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

pub(crate) fn opt_id_string<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(de)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct User {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub profile_photo_url: Option<String>,
}

/// Display identity pinned to a message at ingestion time.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Sender {
    pub id: String,
    pub username: String,
}

impl From<&User> for Sender {
    fn from(user: &User) -> Self {
        Sender {
            id: user.id.clone(),
            username: user.username.clone(),
        }
    }
}

/// Canonical message record. Every source (history fetch, push event,
/// optimistic echo) is reduced to this shape before it reaches the store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub id: String,
    pub content: String,
    pub user_id: String,
    pub chat_id: String,
    /// RFC 3339 string as delivered by the server; empty when history
    /// omitted it. Never fabricated for history rows.
    pub created_at: String,
    pub sender: Sender,
}

impl Message {
    /// Client-generated ids (`temp-*` from optimistic sends, `ws-*`
    /// synthesized for id-less pushes) that an authoritative copy may
    /// later replace.
    pub fn is_placeholder(&self) -> bool {
        self.id.starts_with("temp-") || self.id.starts_with("ws-")
    }
}

/// Message as the REST API ships it. Field presence varies between
/// endpoints, so everything is optional here; `normalize::history_message`
/// turns this into a canonical [`Message`] or drops it.
#[derive(Deserialize, Clone, Debug)]
pub struct WireMessage {
    #[serde(default, deserialize_with = "opt_id_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub user: Option<User>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct Chat {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub other_user: Option<User>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct LastMessage {
    pub content: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// `GET /api/chats/:id` response: the conversation plus its history.
#[derive(Deserialize, Clone, Debug)]
pub struct ChatHistory {
    #[serde(alias = "chat")]
    pub conversation: Chat,
    #[serde(default)]
    pub messages: Vec<WireMessage>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct LoginResponse {
    pub token: String,
    #[serde(default)]
    pub user: Option<User>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct Community {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub profile_photo_url: Option<String>,
    #[serde(default)]
    pub banner_url: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct Post {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub community_id: Option<String>,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub upvotes_count: Option<i64>,
    #[serde(default)]
    pub upvoted: Option<bool>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct Comment {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub content: String,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub post_id: Option<String>,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub upvotes_count: Option<i64>,
    #[serde(default)]
    pub upvoted: Option<bool>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_and_string_ids_decode_alike() {
        let numeric: User = serde_json::from_str(r#"{"id": 7, "username": "maya"}"#).unwrap();
        let stringy: User = serde_json::from_str(r#"{"id": "7", "username": "maya"}"#).unwrap();
        assert_eq!(numeric.id, "7");
        assert_eq!(numeric.id, stringy.id);
    }

    #[test]
    fn test_wire_message_tolerates_sparse_payloads() {
        let wire: WireMessage = serde_json::from_str(r#"{"body": "hi"}"#).unwrap();
        assert_eq!(wire.body.as_deref(), Some("hi"));
        assert!(wire.id.is_none());
        assert!(wire.user_id.is_none());
    }

    #[test]
    fn test_chat_history_accepts_chat_alias() {
        let payload = r#"{
            "chat": {"id": 3, "other_user": {"id": 2, "username": "sam"}},
            "messages": [{"id": 10, "content": "yo", "user_id": 2, "chat_id": 3}]
        }"#;
        let history: ChatHistory = serde_json::from_str(payload).unwrap();
        assert_eq!(history.conversation.id, "3");
        assert_eq!(history.messages.len(), 1);
        assert_eq!(history.messages[0].user_id.as_deref(), Some("2"));
    }

    #[test]
    fn test_placeholder_ids() {
        let mut msg = Message {
            id: "temp-1732000000000".into(),
            content: "hey".into(),
            user_id: "1".into(),
            chat_id: "3".into(),
            created_at: String::new(),
            sender: Sender {
                id: "1".into(),
                username: "maya".into(),
            },
        };
        assert!(msg.is_placeholder());
        msg.id = "ws-1732000000000".into();
        assert!(msg.is_placeholder());
        msg.id = "482".into();
        assert!(!msg.is_placeholder());
    }
}
