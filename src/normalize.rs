//! Shape detection for inbound payloads. The wire carries at least three
//! historically grown formats plus control signals; everything is reduced to
//! [`Inbound`] by a fixed, ordered rule list so the precedence stays auditable.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::models::{Message, Sender, WireMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Ping,
    Pong,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Channel housekeeping, never shown to the user.
    Control(ControlKind),
    Message(Message),
    /// Unusable payload. Logged, otherwise ignored.
    Discard,
}

/// What shape detection needs to know beyond the payload itself.
pub struct NormalizeContext<'a> {
    pub chat_id: &'a str,
    pub current_user: &'a Sender,
    pub other_user: &'a Sender,
    pub now: DateTime<Utc>,
}

/// Rules, first match wins:
/// 1. recognized control `type` -> [`Inbound::Control`]
/// 2. legacy `"key"=>"value"` hash string -> extract `body`, failure discards
/// 3. string that parses as JSON -> re-enter shape detection on the result
/// 4. structured data -> field precedence chains (see below)
/// 5. nothing usable -> [`Inbound::Discard`]
pub fn normalize(raw: &Value, ctx: &NormalizeContext) -> Inbound {
    if let Some(kind) = control_kind(raw) {
        return Inbound::Control(kind);
    }

    if let Value::String(s) = raw {
        if s.contains("\"=>") {
            return match extract_legacy_body(s) {
                Some(content) => legacy_message(s, content, ctx),
                None => {
                    log::debug!("legacy payload without a body field dropped: {}", s);
                    Inbound::Discard
                }
            };
        }
        if let Ok(parsed) = serde_json::from_str::<Value>(s) {
            return normalize(&parsed, ctx);
        }
        log::debug!("unrecognized string payload dropped");
        return Inbound::Discard;
    }

    structured_message(raw, ctx)
}

fn control_kind(raw: &Value) -> Option<ControlKind> {
    match raw.get("type").and_then(Value::as_str)? {
        "ping" => Some(ControlKind::Ping),
        "pong" => Some(ControlKind::Pong),
        "connected" => Some(ControlKind::Connected),
        _ => None,
    }
}

/// Content comes from the first of `message.body`, `body`, `content`; the
/// sender id from the first of `message.user_id`, `user_id`, `sender_id`,
/// `user.id`. Ids and timestamps are synthesized when absent, so a push
/// event always yields a well-formed record or nothing.
fn structured_message(raw: &Value, ctx: &NormalizeContext) -> Inbound {
    let nested = raw.get("message");

    // Events addressed to another conversation never cross over.
    if let Some(chat_id) = first_id(&[raw.get("chat_id"), nested.and_then(|m| m.get("chat_id"))]) {
        if chat_id != ctx.chat_id {
            log::debug!(
                "dropping event for chat {} while chat {} is active",
                chat_id,
                ctx.chat_id
            );
            return Inbound::Discard;
        }
    }

    let Some(content) = first_text(&[
        nested.and_then(|m| m.get("body")),
        raw.get("body"),
        raw.get("content"),
    ]) else {
        log::debug!("payload without content dropped");
        return Inbound::Discard;
    };

    let Some(user_id) = first_id(&[
        nested.and_then(|m| m.get("user_id")),
        raw.get("user_id"),
        raw.get("sender_id"),
        raw.get("user").and_then(|u| u.get("id")),
    ]) else {
        log::debug!("payload without a sender dropped");
        return Inbound::Discard;
    };

    let id = first_id(&[raw.get("id"), nested.and_then(|m| m.get("id"))])
        .unwrap_or_else(|| format!("ws-{}", ctx.now.timestamp_millis()));

    let created_at = first_text(&[raw.get("created_at"), nested.and_then(|m| m.get("created_at"))])
        .unwrap_or_else(|| ctx.now.to_rfc3339_opts(SecondsFormat::Millis, true));

    Inbound::Message(Message {
        id,
        content,
        user_id: user_id.clone(),
        chat_id: ctx.chat_id.to_string(),
        created_at,
        sender: resolve_sender(&user_id, ctx),
    })
}

fn legacy_message(s: &str, content: String, ctx: &NormalizeContext) -> Inbound {
    // Captured legacy frames carry user_id only sometimes; missing
    // attribution falls back to the current user.
    let user_id = extract_legacy_user_id(s).unwrap_or_else(|| ctx.current_user.id.clone());
    Inbound::Message(Message {
        id: format!("ws-{}", ctx.now.timestamp_millis()),
        content,
        user_id: user_id.clone(),
        chat_id: ctx.chat_id.to_string(),
        created_at: ctx.now.to_rfc3339_opts(SecondsFormat::Millis, true),
        sender: resolve_sender(&user_id, ctx),
    })
}

/// REST history rows get the same canonicalization minus timestamp
/// synthesis: a row the server did not stamp stays unstamped.
pub fn history_message(wire: WireMessage, ctx: &NormalizeContext) -> Option<Message> {
    if let Some(chat_id) = wire.chat_id.as_deref() {
        if chat_id != ctx.chat_id {
            log::debug!(
                "dropping history row for chat {} while loading chat {}",
                chat_id,
                ctx.chat_id
            );
            return None;
        }
    }

    let content = [&wire.body, &wire.content]
        .into_iter()
        .flatten()
        .find(|s| !s.trim().is_empty())?
        .clone();
    let user_id = wire
        .user_id
        .clone()
        .or_else(|| wire.user.as_ref().map(|u| u.id.clone()))?;
    // The REST payload's user snapshot is authoritative when present.
    let sender = wire
        .user
        .as_ref()
        .map(Sender::from)
        .unwrap_or_else(|| resolve_sender(&user_id, ctx));

    Some(Message {
        id: wire
            .id
            .unwrap_or_else(|| format!("ws-{}", ctx.now.timestamp_millis())),
        content,
        user_id,
        chat_id: ctx.chat_id.to_string(),
        created_at: wire.created_at.unwrap_or_default(),
        sender,
    })
}

/// Direct messages only have two parties, so an id that is not ours belongs
/// to the counterpart. Group chats would need real identity resolution here.
fn resolve_sender(user_id: &str, ctx: &NormalizeContext) -> Sender {
    if user_id == ctx.current_user.id {
        ctx.current_user.clone()
    } else {
        ctx.other_user.clone()
    }
}

fn first_text(candidates: &[Option<&Value>]) -> Option<String> {
    candidates
        .iter()
        .copied()
        .flatten()
        .find_map(|v| match v.as_str() {
            Some(s) if !s.trim().is_empty() => Some(s.to_string()),
            _ => None,
        })
}

fn first_id(candidates: &[Option<&Value>]) -> Option<String> {
    candidates.iter().copied().flatten().find_map(value_id)
}

fn value_id(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn extract_legacy_body(s: &str) -> Option<String> {
    let key = r#""body"=>""#;
    let rest = &s[s.find(key)? + key.len()..];
    rest.find('"').map(|end| rest[..end].to_string())
}

fn extract_legacy_user_id(s: &str) -> Option<String> {
    let key = r#""user_id"=>"#;
    let rest = &s[s.find(key)? + key.len()..];
    if let Some(quoted) = rest.strip_prefix('"') {
        let end = quoted.find('"')?;
        return (end > 0).then(|| quoted[..end].to_string());
    }
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    (!digits.is_empty()).then_some(digits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixture {
        current: Sender,
        other: Sender,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                current: Sender {
                    id: "1".into(),
                    username: "maya".into(),
                },
                other: Sender {
                    id: "2".into(),
                    username: "sam".into(),
                },
            }
        }

        fn ctx(&self) -> NormalizeContext<'_> {
            NormalizeContext {
                chat_id: "7",
                current_user: &self.current,
                other_user: &self.other,
                now: fixed_now(),
            }
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T12:00:00.000Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn expect_message(inbound: Inbound) -> Message {
        match inbound {
            Inbound::Message(m) => m,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[test]
    fn test_legacy_hash_body_extraction() {
        let fx = Fixture::new();
        let raw = Value::String(r#"{"body"=>"hi there"}"#.to_string());
        let msg = expect_message(normalize(&raw, &fx.ctx()));
        assert_eq!(msg.content, "hi there");
        assert!(msg.id.starts_with("ws-"));
        // No attribution in the frame: falls back to the current user.
        assert_eq!(msg.user_id, "1");
        assert_eq!(msg.sender.username, "maya");
    }

    #[test]
    fn test_legacy_hash_with_numeric_user_id() {
        let fx = Fixture::new();
        let raw = Value::String(r#"{"body"=>"yo", "user_id"=>2}"#.to_string());
        let msg = expect_message(normalize(&raw, &fx.ctx()));
        assert_eq!(msg.user_id, "2");
        assert_eq!(msg.sender.username, "sam");
    }

    #[test]
    fn test_legacy_hash_with_quoted_user_id() {
        let fx = Fixture::new();
        let raw = Value::String(r#"{"user_id"=>"2", "body"=>"yo"}"#.to_string());
        let msg = expect_message(normalize(&raw, &fx.ctx()));
        assert_eq!(msg.user_id, "2");
    }

    #[test]
    fn test_legacy_hash_without_body_discarded() {
        let fx = Fixture::new();
        let raw = Value::String(r#"{"foo"=>"bar"}"#.to_string());
        assert_eq!(normalize(&raw, &fx.ctx()), Inbound::Discard);
    }

    #[test]
    fn test_control_signals_suppressed() {
        let fx = Fixture::new();
        assert_eq!(
            normalize(&json!({"type": "ping"}), &fx.ctx()),
            Inbound::Control(ControlKind::Ping)
        );
        assert_eq!(
            normalize(&json!({"type": "pong"}), &fx.ctx()),
            Inbound::Control(ControlKind::Pong)
        );
        assert_eq!(
            normalize(&json!({"type": "connected"}), &fx.ctx()),
            Inbound::Control(ControlKind::Connected)
        );
        // Control wins even when the frame smuggles message-ish fields.
        assert_eq!(
            normalize(
                &json!({"type": "ping", "message": {"body": "x"}}),
                &fx.ctx()
            ),
            Inbound::Control(ControlKind::Ping)
        );
    }

    #[test]
    fn test_json_string_payload_reparsed() {
        let fx = Fixture::new();
        let raw = Value::String(
            json!({"id": 9, "body": "hi", "user_id": 2, "chat_id": 7}).to_string(),
        );
        let msg = expect_message(normalize(&raw, &fx.ctx()));
        assert_eq!(msg.id, "9");
        assert_eq!(msg.content, "hi");
    }

    #[test]
    fn test_nested_message_body_wins() {
        let fx = Fixture::new();
        let raw = json!({
            "message": {"body": "nested", "user_id": 2},
            "body": "mid",
            "content": "outer"
        });
        let msg = expect_message(normalize(&raw, &fx.ctx()));
        assert_eq!(msg.content, "nested");
    }

    #[test]
    fn test_body_beats_content() {
        let fx = Fixture::new();
        let raw = json!({"body": "b", "content": "c", "user_id": 2});
        let msg = expect_message(normalize(&raw, &fx.ctx()));
        assert_eq!(msg.content, "b");
    }

    #[test]
    fn test_sender_chain_precedence() {
        let fx = Fixture::new();
        let raw = json!({
            "body": "x",
            "message": {"user_id": 1},
            "user_id": 2,
            "sender_id": 3,
            "user": {"id": 4, "username": "ghost"}
        });
        let msg = expect_message(normalize(&raw, &fx.ctx()));
        assert_eq!(msg.user_id, "1");
        assert_eq!(msg.sender.username, "maya");
    }

    #[test]
    fn test_user_object_id_as_last_resort() {
        let fx = Fixture::new();
        let raw = json!({"body": "x", "user": {"id": 2, "username": "sam"}});
        let msg = expect_message(normalize(&raw, &fx.ctx()));
        assert_eq!(msg.user_id, "2");
        assert_eq!(msg.sender.username, "sam");
    }

    #[test]
    fn test_missing_sender_discarded() {
        let fx = Fixture::new();
        assert_eq!(normalize(&json!({"body": "x"}), &fx.ctx()), Inbound::Discard);
    }

    #[test]
    fn test_empty_content_discarded() {
        let fx = Fixture::new();
        assert_eq!(
            normalize(&json!({"body": "", "content": "", "user_id": 2}), &fx.ctx()),
            Inbound::Discard
        );
        assert_eq!(
            normalize(&json!({"body": "   ", "user_id": 2}), &fx.ctx()),
            Inbound::Discard
        );
    }

    #[test]
    fn test_cross_chat_events_discarded() {
        let fx = Fixture::new();
        assert_eq!(
            normalize(&json!({"chat_id": 9, "body": "x", "user_id": 2}), &fx.ctx()),
            Inbound::Discard
        );
        assert_eq!(
            normalize(
                &json!({"message": {"chat_id": "9", "body": "x", "user_id": 2}}),
                &fx.ctx()
            ),
            Inbound::Discard
        );
    }

    #[test]
    fn test_id_and_timestamp_synthesis() {
        let fx = Fixture::new();
        let msg = expect_message(normalize(&json!({"body": "x", "user_id": 2}), &fx.ctx()));
        assert_eq!(msg.id, format!("ws-{}", fixed_now().timestamp_millis()));
        assert_eq!(msg.created_at, "2025-03-01T12:00:00.000Z");
    }

    #[test]
    fn test_wire_timestamp_kept() {
        let fx = Fixture::new();
        let raw = json!({"body": "x", "user_id": 2, "created_at": "2025-02-28T08:00:00Z"});
        let msg = expect_message(normalize(&raw, &fx.ctx()));
        assert_eq!(msg.created_at, "2025-02-28T08:00:00Z");
    }

    #[test]
    fn test_bare_string_discarded() {
        let fx = Fixture::new();
        let raw = Value::String("hello there".to_string());
        assert_eq!(normalize(&raw, &fx.ctx()), Inbound::Discard);
    }

    #[test]
    fn test_non_object_payloads_discarded() {
        let fx = Fixture::new();
        assert_eq!(normalize(&json!(42), &fx.ctx()), Inbound::Discard);
        assert_eq!(normalize(&json!(null), &fx.ctx()), Inbound::Discard);
        assert_eq!(normalize(&json!(["a", "b"]), &fx.ctx()), Inbound::Discard);
    }

    #[test]
    fn test_history_row_canonicalizes() {
        let fx = Fixture::new();
        let wire: WireMessage = serde_json::from_value(json!({
            "id": 10,
            "content": "from history",
            "user_id": 2,
            "chat_id": 7,
            "created_at": "2025-02-28T08:00:00Z",
            "user": {"id": 2, "username": "sam"}
        }))
        .unwrap();
        let msg = history_message(wire, &fx.ctx()).unwrap();
        assert_eq!(msg.id, "10");
        assert_eq!(msg.content, "from history");
        assert_eq!(msg.sender.username, "sam");
        assert_eq!(msg.created_at, "2025-02-28T08:00:00Z");
    }

    #[test]
    fn test_history_row_without_timestamp_stays_unstamped() {
        let fx = Fixture::new();
        let wire: WireMessage =
            serde_json::from_value(json!({"id": 10, "body": "old", "user_id": 2})).unwrap();
        let msg = history_message(wire, &fx.ctx()).unwrap();
        assert_eq!(msg.created_at, "");
    }

    #[test]
    fn test_history_row_for_other_chat_dropped() {
        let fx = Fixture::new();
        let wire: WireMessage =
            serde_json::from_value(json!({"id": 10, "body": "x", "user_id": 2, "chat_id": 9}))
                .unwrap();
        assert!(history_message(wire, &fx.ctx()).is_none());
    }

    #[test]
    fn test_history_row_without_content_dropped() {
        let fx = Fixture::new();
        let wire: WireMessage =
            serde_json::from_value(json!({"id": 10, "user_id": 2})).unwrap();
        assert!(history_message(wire, &fx.ctx()).is_none());
    }
}
