//! Tracing layer that mirrors the bot's own log lines into a Telegram chat.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use crate::chatbot::telegram::ChatTransport;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const MAX_BATCH: usize = 50;

/// The transport logs its own failures; forwarding those would loop.
const TRANSPORT_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::chatbot::telegram");

/// Log message with priority.
#[derive(Debug, PartialEq, Eq)]
enum LogMessage {
    /// WARN/ERROR, sent immediately
    Urgent(String),
    /// INFO, batched
    Info(String),
}

pub struct TelegramLogLayer {
    tx: mpsc::UnboundedSender<LogMessage>,
    /// Only events whose target starts with this are forwarded.
    target_prefix: &'static str,
}

impl TelegramLogLayer {
    /// Spawn the sender task. Must be called inside a tokio runtime.
    pub fn new(transport: Arc<dyn ChatTransport>, chat_id: i64) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogMessage>();

        tokio::spawn(async move {
            let mut batch: Vec<String> = Vec::new();
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);

            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(LogMessage::Urgent(text)) => send_log(&*transport, chat_id, &text).await,
                        Some(LogMessage::Info(text)) => {
                            batch.push(text);
                            if batch.len() >= MAX_BATCH {
                                flush(&*transport, chat_id, &mut batch).await;
                            }
                        }
                        None => {
                            flush(&*transport, chat_id, &mut batch).await;
                            break;
                        }
                    },
                    _ = interval.tick() => flush(&*transport, chat_id, &mut batch).await,
                }
            }
        });

        Self { tx, target_prefix: env!("CARGO_CRATE_NAME") }
    }
}

async fn send_log(transport: &dyn ChatTransport, chat_id: i64, text: &str) {
    // Logging a failure here would feed back into this layer
    if let Err(e) = transport.send_text(chat_id, text).await {
        eprintln!("Failed to send log to Telegram: {e}");
    }
}

async fn flush(transport: &dyn ChatTransport, chat_id: i64, batch: &mut Vec<String>) {
    if batch.is_empty() {
        return;
    }
    let combined = batch.join("\n");
    batch.clear();
    send_log(transport, chat_id, &combined).await;
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else if self.message.is_empty() {
            self.message = format!("{} = {:?}", field.name(), value);
        } else {
            self.message.push_str(&format!(", {} = {:?}", field.name(), value));
        }
    }
}

fn classify(level: Level, message: String) -> Option<LogMessage> {
    match level {
        Level::ERROR => Some(LogMessage::Urgent(format!("❌ {message}"))),
        Level::WARN => Some(LogMessage::Urgent(format!("⚠️ {message}"))),
        Level::INFO => Some(LogMessage::Info(message)),
        _ => None,
    }
}

impl<S: Subscriber> Layer<S> for TelegramLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // HTTP and Telegram internals would log about our own log sends
        let target = metadata.target();
        if !target.starts_with(self.target_prefix) || target.starts_with(TRANSPORT_TARGET) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        if let Some(msg) = classify(*metadata.level(), visitor.message)
            && self.tx.send(msg).is_err()
        {
            eprintln!("Log channel closed, message dropped");
        }
    }
}
