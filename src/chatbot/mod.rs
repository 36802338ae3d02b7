//! Chatbot module - turns Telegram messages into calendar actions and expense records.

pub mod action;
pub mod database;
pub mod datetime;
pub mod engine;
pub mod executor;
pub mod expenses;
pub mod intent;
pub mod message;
pub mod schema;
pub mod session;
pub mod telegram;

#[cfg(test)]
mod tests;

pub use database::Database;
pub use engine::{ChatbotEngine, Command, EngineConfig};
pub use executor::CalendarProvider;
pub use expenses::ExpenseLedger;
pub use message::{SessionKey, Utterance};
pub use telegram::{ChatTransport, TelegramClient};
