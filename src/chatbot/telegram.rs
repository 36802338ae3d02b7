//! Telegram client using teloxide.

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ParseMode};
use thiserror::Error;
use tracing::warn;

/// Telegram's limit for a single message.
pub const MAX_MESSAGE_LENGTH: usize = 4096;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Telegram request failed: {0}")]
    Request(#[from] teloxide::RequestError),
}

/// Inline keyboard button carrying callback data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub text: String,
    pub data: String,
}

impl Button {
    pub fn new(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self { text: text.into(), data: data.into() }
    }
}

/// Outgoing side of the chat. Text is plain; implementations escape it.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send text, split if too long. Returns the id of the last message sent.
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<i64, TransportError>;
    /// Send text with an inline keyboard below it.
    async fn send_with_buttons(&self, chat_id: i64, text: &str, rows: Vec<Vec<Button>>) -> Result<i64, TransportError>;
    /// Replace a message's text, dropping its keyboard.
    async fn edit_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<(), TransportError>;
}

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<i64, TransportError> {
        let mut last_id = 0;
        for chunk in split_message(&html_escape(text), MAX_MESSAGE_LENGTH) {
            let msg = self
                .bot
                .send_message(ChatId(chat_id), chunk)
                .parse_mode(ParseMode::Html)
                .await
                .inspect_err(|e| warn!("Failed to send: {e}"))?;
            last_id = msg.id.0 as i64;
        }
        Ok(last_id)
    }

    async fn send_with_buttons(&self, chat_id: i64, text: &str, rows: Vec<Vec<Button>>) -> Result<i64, TransportError> {
        let mut chunks = split_message(&html_escape(text), MAX_MESSAGE_LENGTH);
        let last = chunks.pop().unwrap_or_default();
        for chunk in chunks {
            self.bot
                .send_message(ChatId(chat_id), chunk)
                .parse_mode(ParseMode::Html)
                .await?;
        }

        let keyboard = InlineKeyboardMarkup::new(rows.into_iter().map(|row| {
            row.into_iter()
                .map(|b| InlineKeyboardButton::callback(b.text, b.data))
                .collect::<Vec<_>>()
        }));
        let msg = self
            .bot
            .send_message(ChatId(chat_id), last)
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboard)
            .await
            .inspect_err(|e| warn!("Failed to send keyboard: {e}"))?;
        Ok(msg.id.0 as i64)
    }

    async fn edit_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<(), TransportError> {
        let text = split_message(&html_escape(text), MAX_MESSAGE_LENGTH)
            .into_iter()
            .next()
            .unwrap_or_default();
        self.bot
            .edit_message_text(ChatId(chat_id), MessageId(message_id as i32), text)
            .parse_mode(ParseMode::Html)
            .await
            .inspect_err(|e| warn!("Failed to edit message {message_id}: {e}"))?;
        Ok(())
    }
}

/// Escape text for HTML parse mode.
pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Split escaped text into chunks of at most `limit` chars, preferring line
/// breaks, then spaces, and never cutting through an HTML entity.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.chars().count() > limit {
        let hard = rest.char_indices().nth(limit).map(|(i, _)| i).unwrap_or(rest.len());
        let window = &rest[..hard];
        let mut cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(hard);
        if let Some(amp) = window[..cut].rfind('&')
            && !window[amp..cut].contains(';')
            && amp > 0
        {
            cut = amp;
        }
        let chunk = rest[..cut].trim_end();
        // Telegram rejects empty messages
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        rest = rest[cut..].trim_start_matches(['\n', ' ']);
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}
