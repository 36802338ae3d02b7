pub mod chatbot;
pub mod claude;
pub mod config;
pub mod google;
pub mod telegram_log;
