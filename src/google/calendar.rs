//! Google Calendar v3 REST client.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use super::{GoogleError, TokenProvider, check_status};
use crate::chatbot::action::{EventChanges, EventSummary, EventTime, NewEvent};
use crate::chatbot::datetime::parse_google_time;
use crate::chatbot::executor::CalendarProvider;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/calendar/v3";
const UNTITLED: &str = "(senza titolo)";

#[derive(Deserialize)]
struct EventList {
    #[serde(default)]
    items: Vec<ApiEvent>,
}

#[derive(Deserialize)]
struct ApiEvent {
    id: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    start: Option<ApiTime>,
    #[serde(default)]
    end: Option<ApiTime>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiTime {
    #[serde(default)]
    date_time: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

impl ApiEvent {
    fn into_summary(self, tz: Tz) -> Option<EventSummary> {
        let parse = |t: &ApiTime| parse_google_time(t.date_time.as_deref(), t.date.as_deref(), tz);
        let start = self.start.as_ref().and_then(parse)?;
        Some(EventSummary {
            id: self.id,
            summary: self
                .summary
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| UNTITLED.to_string()),
            start,
            end: self.end.as_ref().and_then(parse),
            location: self.location.filter(|s| !s.is_empty()),
            description: self.description.filter(|s| !s.is_empty()),
        })
    }
}

pub struct GoogleCalendar {
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    base_url: String,
    calendar_id: String,
    timezone: Tz,
}

impl GoogleCalendar {
    pub fn new(tokens: Arc<dyn TokenProvider>, calendar_id: impl Into<String>, timezone: Tz) -> Self {
        Self {
            http: reqwest::Client::new(),
            tokens,
            base_url: DEFAULT_BASE_URL.to_string(),
            calendar_id: calendar_id.into(),
            timezone,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn events_url(&self) -> String {
        format!(
            "{}/calendars/{}/events",
            self.base_url,
            urlencoding::encode(&self.calendar_id)
        )
    }

    fn event_url(&self, event_id: &str) -> String {
        format!("{}/{}", self.events_url(), urlencoding::encode(event_id))
    }

    async fn parse_event(&self, response: reqwest::Response) -> Result<EventSummary, GoogleError> {
        let event: ApiEvent = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| GoogleError::Parse(format!("event: {e}")))?;
        event
            .into_summary(self.timezone)
            .ok_or_else(|| GoogleError::Parse("event has no start".to_string()))
    }
}

/// `start`/`end` object. When patching, the unused key is nulled so an
/// event can switch between timed and all-day.
pub(crate) fn time_json(time: &EventTime, tz: Tz, clear_other: bool) -> Value {
    let mut map = Map::new();
    match time {
        EventTime::At(dt) => {
            map.insert("dateTime".into(), json!(dt.to_rfc3339_opts(SecondsFormat::Secs, false)));
            map.insert("timeZone".into(), json!(tz.name()));
            if clear_other {
                map.insert("date".into(), Value::Null);
            }
        }
        EventTime::AllDay(d) => {
            map.insert("date".into(), json!(d.format("%Y-%m-%d").to_string()));
            if clear_other {
                map.insert("dateTime".into(), Value::Null);
            }
        }
    }
    Value::Object(map)
}

/// Request body for `events.insert`.
///
/// Participants with an e-mail address become attendees; plain names are
/// listed at the end of the description.
pub(crate) fn insert_body(event: &NewEvent, tz: Tz) -> Value {
    let (emails, names): (Vec<&String>, Vec<&String>) =
        event.participants.iter().partition(|p| p.contains('@'));

    let mut description = event.description.clone().unwrap_or_default();
    if !names.is_empty() {
        if !description.is_empty() {
            description.push_str("\n\n");
        }
        let names: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        description.push_str(&format!("Partecipanti: {}", names.join(", ")));
    }

    let mut body = json!({
        "summary": event.title,
        "start": time_json(&event.start, tz, false),
        "end": time_json(&event.end, tz, false),
        "reminders": { "useDefault": true },
    });
    if let Some(ref location) = event.location {
        body["location"] = json!(location);
    }
    if !description.is_empty() {
        body["description"] = json!(description);
    }
    if !emails.is_empty() {
        body["attendees"] = emails.iter().map(|e| json!({ "email": e })).collect();
    }
    if let Some(ref recurrence) = event.recurrence {
        body["recurrence"] = json!([recurrence.to_rrule()]);
    }
    body
}

/// Request body for `events.patch`: only the changed fields.
pub(crate) fn patch_body(changes: &EventChanges, tz: Tz) -> Value {
    let mut body = Map::new();
    if let Some(ref title) = changes.title {
        body.insert("summary".into(), json!(title));
    }
    if let Some(ref start) = changes.start {
        body.insert("start".into(), time_json(start, tz, true));
    }
    if let Some(ref end) = changes.end {
        body.insert("end".into(), time_json(end, tz, true));
    }
    if let Some(ref location) = changes.location {
        body.insert("location".into(), json!(location));
    }
    if let Some(ref description) = changes.description {
        body.insert("description".into(), json!(description));
    }
    Value::Object(body)
}

#[async_trait]
impl CalendarProvider for GoogleCalendar {
    async fn upcoming(&self, max_results: u32) -> Result<Vec<EventSummary>, GoogleError> {
        let token = self.tokens.access_token().await?;
        let time_min = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let max_results = max_results.to_string();
        let response = self
            .http
            .get(self.events_url())
            .bearer_auth(token)
            .query(&[
                ("timeMin", time_min.as_str()),
                ("singleEvents", "true"),
                ("orderBy", "startTime"),
                ("maxResults", max_results.as_str()),
            ])
            .send()
            .await?;
        let list: EventList = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| GoogleError::Parse(format!("event list: {e}")))?;

        let events: Vec<EventSummary> = list
            .items
            .into_iter()
            .filter_map(|e| e.into_summary(self.timezone))
            .collect();
        debug!("Fetched {} upcoming events", events.len());
        Ok(events)
    }

    async fn insert(&self, event: &NewEvent) -> Result<EventSummary, GoogleError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .post(self.events_url())
            .bearer_auth(token)
            .json(&insert_body(event, self.timezone))
            .send()
            .await?;
        self.parse_event(response).await
    }

    async fn patch(&self, event_id: &str, changes: &EventChanges) -> Result<EventSummary, GoogleError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .patch(self.event_url(event_id))
            .bearer_auth(token)
            .json(&patch_body(changes, self.timezone))
            .send()
            .await?;
        self.parse_event(response).await
    }

    async fn delete(&self, event_id: &str) -> Result<(), GoogleError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .delete(self.event_url(event_id))
            .bearer_auth(token)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}
