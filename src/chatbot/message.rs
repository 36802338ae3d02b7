//! Utterances, conversation turns and their prompt formatting.
//!
//! Uses XML format with entity escaping to prevent prompt injection.
//! User content is escaped so `<`, `>`, `&` become `&lt;`, `&gt;`, `&amp;`.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Identifies one user's conversation in one chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub chat_id: i64,
    pub user_id: i64,
}

impl SessionKey {
    pub fn new(chat_id: i64, user_id: i64) -> Self {
        Self { chat_id, user_id }
    }
}

/// One free-text message from a user. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    session: SessionKey,
    message_id: i64,
    username: String,
    text: String,
    received_at: DateTime<Utc>,
}

impl Utterance {
    pub fn new(
        session: SessionKey,
        message_id: i64,
        username: impl Into<String>,
        text: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session,
            message_id,
            username: username.into(),
            text: text.into(),
            received_at,
        }
    }

    pub fn session(&self) -> SessionKey {
        self.session
    }

    pub fn message_id(&self) -> i64 {
        self.message_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Format as XML for the interpreter prompt.
    ///
    /// ```xml
    /// <msg name="Alice" time="2026-10-16 10:31">sposta il dentista a lunedì</msg>
    /// ```
    pub fn format(&self, tz: Tz) -> String {
        format!(
            "<msg name=\"{}\" time=\"{}\">{}</msg>",
            xml_escape_attr(&self.username),
            self.received_at.with_timezone(&tz).format("%Y-%m-%d %H:%M"),
            xml_escape(&self.text)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Bot,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Bot => "bot",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "bot" => Speaker::Bot,
            _ => Speaker::User,
        }
    }
}

/// A past message in the conversation, user or bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub session: SessionKey,
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Max chars of a past turn quoted in the prompt.
const MAX_TURN_LENGTH: usize = 400;

impl Turn {
    pub fn format(&self, tz: Tz) -> String {
        let text = if self.text.len() > MAX_TURN_LENGTH {
            format!("{}...", truncate_safe(&self.text, MAX_TURN_LENGTH))
        } else {
            self.text.clone()
        };
        format!(
            "<turn from=\"{}\" time=\"{}\">{}</turn>",
            self.speaker.as_str(),
            self.timestamp.with_timezone(&tz).format("%Y-%m-%d %H:%M"),
            xml_escape(&text)
        )
    }
}

/// Escape a string for safe inclusion in XML content.
pub fn xml_escape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '&' => result.push_str("&amp;"),
            _ => result.push(c),
        }
    }
    result
}

/// Escape a string for safe inclusion in XML attributes (also escapes quotes).
pub fn xml_escape_attr(s: &str) -> String {
    xml_escape(s).replace('"', "&quot;")
}

/// Safely truncate a string at a char boundary.
pub fn truncate_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
