//! Per-conversation message list with the reconciliation rules that keep
//! three concurrent sources (history fetch, optimistic echoes, push events)
//! from producing duplicates or reordering.

use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::config::Config;
use crate::models::{Message, Sender};

pub struct MessageStore {
    chat_id: String,
    messages: Vec<Message>,
    tolerance_ms: i64,
    scroll: ScrollNudge,
}

impl MessageStore {
    pub fn new(chat_id: &str, cfg: &Config) -> Self {
        MessageStore {
            chat_id: chat_id.to_string(),
            messages: Vec::new(),
            tolerance_ms: cfg.dedup_tolerance.as_millis() as i64,
            scroll: ScrollNudge::new(cfg.scroll_debounce),
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Wholesale replacement from a history fetch. Server order is kept
    /// as delivered; the store never re-sorts.
    pub fn load_history(&mut self, messages: Vec<Message>) {
        log::debug!(
            "chat {}: history loaded with {} messages",
            self.chat_id,
            messages.len()
        );
        self.messages = messages;
        self.scroll.mark();
    }

    /// Admit one candidate from any source. Returns `true` when the list
    /// changed (a new entry or a placeholder replacement), `false` when the
    /// candidate was already represented.
    pub fn append(&mut self, candidate: Message) -> bool {
        if self.messages.iter().any(|m| m.id == candidate.id) {
            log::debug!("chat {}: dropping duplicate id {}", self.chat_id, candidate.id);
            return false;
        }

        // An authoritative copy of a pending local echo: same author, same
        // text, stamped within the tolerance window. Adopt the server's
        // identity in place so the entry keeps its position.
        if let Some(ix) = self.messages.iter().position(|m| {
            m.is_placeholder()
                && m.user_id == candidate.user_id
                && m.content == candidate.content
                && within_tolerance(&m.created_at, &candidate.created_at, self.tolerance_ms)
        }) {
            log::debug!(
                "chat {}: placeholder {} confirmed as {}",
                self.chat_id,
                self.messages[ix].id,
                candidate.id
            );
            self.messages[ix] = candidate;
            self.scroll.mark();
            return true;
        }

        self.messages.push(candidate);
        self.scroll.mark();
        true
    }

    /// Record a local send immediately, before any network round trip.
    /// Always appends; dedup only applies to candidates arriving from the
    /// network. Returns the placeholder id.
    pub fn append_optimistic(&mut self, text: &str, sender: &Sender, now: DateTime<Utc>) -> String {
        let mut millis = now.timestamp_millis();
        let mut id = format!("temp-{millis}");
        while self.messages.iter().any(|m| m.id == id) {
            millis += 1;
            id = format!("temp-{millis}");
        }
        self.messages.push(Message {
            id: id.clone(),
            content: text.to_string(),
            user_id: sender.id.clone(),
            chat_id: self.chat_id.clone(),
            created_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            sender: sender.clone(),
        });
        self.scroll.mark();
        id
    }

    /// True when an autoscroll should fire now. Consumes the pending nudge.
    pub fn take_scroll(&mut self, now: Instant) -> bool {
        self.scroll.poll(now)
    }

    /// A nudge is queued but the debounce window has not elapsed yet.
    pub fn scroll_pending(&self) -> bool {
        self.scroll.pending()
    }
}

fn within_tolerance(a: &str, b: &str, tolerance_ms: i64) -> bool {
    let (Ok(a), Ok(b)) = (
        DateTime::parse_from_rfc3339(a),
        DateTime::parse_from_rfc3339(b),
    ) else {
        // Unparseable stamps never fuzzy-match; the candidate falls through
        // to a plain append.
        return false;
    };
    (a - b).num_milliseconds().abs() <= tolerance_ms
}

/// Debounces autoscroll during bursts: at most one nudge per window, with a
/// trailing fire when marks landed mid-window.
struct ScrollNudge {
    window: std::time::Duration,
    pending: bool,
    last: Option<Instant>,
}

impl ScrollNudge {
    fn new(window: std::time::Duration) -> Self {
        ScrollNudge {
            window,
            pending: false,
            last: None,
        }
    }

    fn mark(&mut self) {
        self.pending = true;
    }

    fn poll(&mut self, now: Instant) -> bool {
        if !self.pending {
            return false;
        }
        let due = match self.last {
            None => true,
            Some(last) => now.duration_since(last) >= self.window,
        };
        if due {
            self.pending = false;
            self.last = Some(now);
        }
        due
    }

    fn pending(&self) -> bool {
        self.pending
    }
}
