//! Applies confirmed calendar actions.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::chatbot::action::{CalendarActionRequest, EventChanges, EventSummary, NewEvent};
use crate::google::GoogleError;

/// A calendar the bot can read and change.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// Next `max_results` events from now, soonest first, recurring events expanded.
    async fn upcoming(&self, max_results: u32) -> Result<Vec<EventSummary>, GoogleError>;
    async fn insert(&self, event: &NewEvent) -> Result<EventSummary, GoogleError>;
    async fn patch(&self, event_id: &str, changes: &EventChanges) -> Result<EventSummary, GoogleError>;
    async fn delete(&self, event_id: &str) -> Result<(), GoogleError>;
}

pub struct Executor {
    calendar: Arc<dyn CalendarProvider>,
}

impl Executor {
    pub fn new(calendar: Arc<dyn CalendarProvider>) -> Self {
        Self { calendar }
    }

    pub fn calendar(&self) -> &Arc<dyn CalendarProvider> {
        &self.calendar
    }

    /// Apply a request and return the message for the user.
    ///
    /// An event that disappeared in the meantime is reported, not treated as
    /// an error.
    pub async fn apply(&self, request: &CalendarActionRequest) -> Result<String, GoogleError> {
        match request {
            CalendarActionRequest::Create(event) => {
                let created = self.calendar.insert(event).await?;
                info!("Created event {} ({})", created.id, created.summary);
                Ok(format!("✅ Evento creato: {} ({})", created.summary, created.start.display()))
            }
            CalendarActionRequest::Update { target, changes } => {
                match self.calendar.patch(&target.id, changes).await {
                    Ok(updated) => {
                        info!("Updated event {}", updated.id);
                        Ok(format!("✅ Evento aggiornato: {} ({})", updated.summary, updated.start.display()))
                    }
                    Err(e) if e.is_not_found() => {
                        warn!("Event {} vanished before update", target.id);
                        Ok(format!("⚠️ L'evento \"{}\" non esiste più.", target.summary))
                    }
                    Err(e) => Err(e),
                }
            }
            CalendarActionRequest::Delete { target } => match self.calendar.delete(&target.id).await {
                Ok(()) => {
                    info!("Deleted event {}", target.id);
                    Ok(format!("🗑 Evento eliminato: {}", target.summary))
                }
                Err(e) if e.is_not_found() => {
                    warn!("Event {} already gone", target.id);
                    Ok(format!("⚠️ L'evento \"{}\" era già stato eliminato.", target.summary))
                }
                Err(e) => Err(e),
            },
        }
    }
}

/// Numbered listing used by `/eventi` and target pickers.
pub fn format_event_list(events: &[EventSummary]) -> String {
    if events.is_empty() {
        return "Nessun evento in programma.".to_string();
    }
    let mut s = String::from("📅 Prossimi eventi:\n");
    for (i, event) in events.iter().enumerate() {
        let _ = write!(s, "{}. {} - {}", i + 1, event.summary, event.start.display());
        if let Some(ref location) = event.location {
            let _ = write!(s, " @ {location}");
        }
        s.push('\n');
    }
    s
}
