//! Calendar actions produced by the interpreter and applied by the executor.

use chrono::{DateTime, Duration, NaiveDate};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::chatbot::datetime::{format_date, format_datetime};

/// Start or end of an event: either a moment or a whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTime {
    At(DateTime<Tz>),
    AllDay(NaiveDate),
}

impl EventTime {
    pub fn date(&self) -> NaiveDate {
        match self {
            EventTime::At(dt) => dt.date_naive(),
            EventTime::AllDay(d) => *d,
        }
    }

    pub fn is_all_day(&self) -> bool {
        matches!(self, EventTime::AllDay(_))
    }

    /// Human-readable form used in chat replies.
    pub fn display(&self) -> String {
        match self {
            EventTime::At(dt) => format_datetime(dt),
            EventTime::AllDay(d) => format!("{} (tutto il giorno)", format_date(d)),
        }
    }
}

/// An existing event as seen in the upcoming-events snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSummary {
    pub id: String,
    pub summary: String,
    pub start: EventTime,
    pub end: Option<EventTime>,
    pub location: Option<String>,
    pub description: Option<String>,
}

impl EventSummary {
    pub fn to_ref(&self) -> EventRef {
        EventRef {
            id: self.id.clone(),
            summary: self.summary.clone(),
            start: self.start,
            end: self.end,
        }
    }
}

/// Reference to the existing event an update or delete applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRef {
    pub id: String,
    pub summary: String,
    pub start: EventTime,
    pub end: Option<EventTime>,
}

impl EventRef {
    pub fn duration(&self) -> Option<Duration> {
        match (self.start, self.end) {
            (EventTime::At(s), Some(EventTime::At(e))) if e > s => Some(e - s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub frequency: Frequency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<NaiveDate>,
}

impl Recurrence {
    /// RFC 5545 recurrence rule, e.g. `RRULE:FREQ=WEEKLY;COUNT=4`.
    pub fn to_rrule(&self) -> String {
        let freq = match self.frequency {
            Frequency::Daily => "DAILY",
            Frequency::Weekly => "WEEKLY",
            Frequency::Monthly => "MONTHLY",
            Frequency::Yearly => "YEARLY",
        };
        let mut rule = format!("RRULE:FREQ={freq}");
        if let Some(interval) = self.interval.filter(|i| *i > 1) {
            rule.push_str(&format!(";INTERVAL={interval}"));
        }
        // COUNT and UNTIL are mutually exclusive in RFC 5545
        if let Some(count) = self.count.filter(|c| *c > 0) {
            rule.push_str(&format!(";COUNT={count}"));
        } else if let Some(until) = self.until {
            rule.push_str(&format!(";UNTIL={}", until.format("%Y%m%d")));
        }
        rule
    }

    pub fn display(&self) -> String {
        let every = match (self.frequency, self.interval.unwrap_or(1)) {
            (Frequency::Daily, 1) => "ogni giorno".to_string(),
            (Frequency::Weekly, 1) => "ogni settimana".to_string(),
            (Frequency::Monthly, 1) => "ogni mese".to_string(),
            (Frequency::Yearly, 1) => "ogni anno".to_string(),
            (Frequency::Daily, n) => format!("ogni {n} giorni"),
            (Frequency::Weekly, n) => format!("ogni {n} settimane"),
            (Frequency::Monthly, n) => format!("ogni {n} mesi"),
            (Frequency::Yearly, n) => format!("ogni {n} anni"),
        };
        match (self.count, self.until) {
            (Some(c), _) if c > 0 => format!("{every}, {c} volte"),
            (_, Some(u)) => format!("{every} fino al {}", format_date(&u)),
            _ => every,
        }
    }
}

/// A fully specified new event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub title: String,
    pub start: EventTime,
    pub end: EventTime,
    pub location: Option<String>,
    pub description: Option<String>,
    pub participants: Vec<String>,
    pub recurrence: Option<Recurrence>,
}

/// Changes to apply to an existing event. At least one field is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventChanges {
    pub title: Option<String>,
    pub start: Option<EventTime>,
    pub end: Option<EventTime>,
    pub location: Option<String>,
    pub description: Option<String>,
}

impl EventChanges {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.start.is_none()
            && self.end.is_none()
            && self.location.is_none()
            && self.description.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarActionRequest {
    Create(NewEvent),
    Update { target: EventRef, changes: EventChanges },
    Delete { target: EventRef },
}

impl CalendarActionRequest {
    /// Plain-text confirmation prompt shown before the action is applied.
    pub fn describe(&self) -> String {
        match self {
            CalendarActionRequest::Create(event) => {
                let mut s = format!(
                    "Nuovo evento: {}\nInizio: {}\nFine: {}\n",
                    event.title,
                    event.start.display(),
                    event.end.display()
                );
                if let Some(ref location) = event.location {
                    s.push_str(&format!("Luogo: {location}\n"));
                }
                if let Some(ref description) = event.description {
                    s.push_str(&format!("Descrizione: {description}\n"));
                }
                if !event.participants.is_empty() {
                    s.push_str(&format!("Partecipanti: {}\n", event.participants.join(", ")));
                }
                if let Some(ref recurrence) = event.recurrence {
                    s.push_str(&format!("Ripetizione: {}\n", recurrence.display()));
                }
                s
            }
            CalendarActionRequest::Update { target, changes } => {
                let mut s = format!("Modifica: {} ({})\n", target.summary, target.start.display());
                if let Some(ref title) = changes.title {
                    s.push_str(&format!("Nuovo titolo: {title}\n"));
                }
                if let Some(ref start) = changes.start {
                    s.push_str(&format!("Nuovo inizio: {}\n", start.display()));
                }
                if let Some(ref end) = changes.end {
                    s.push_str(&format!("Nuova fine: {}\n", end.display()));
                }
                if let Some(ref location) = changes.location {
                    s.push_str(&format!("Nuovo luogo: {location}\n"));
                }
                if let Some(ref description) = changes.description {
                    s.push_str(&format!("Nuova descrizione: {description}\n"));
                }
                s
            }
            CalendarActionRequest::Delete { target } => {
                format!("Elimina: {} ({})\n", target.summary, target.start.display())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Europe::Rome;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> EventTime {
        EventTime::At(Rome.with_ymd_and_hms(y, m, d, h, min, 0).unwrap())
    }

    #[test]
    fn test_rrule_weekly_count() {
        let r = Recurrence { frequency: Frequency::Weekly, interval: None, count: Some(4), until: None };
        assert_eq!(r.to_rrule(), "RRULE:FREQ=WEEKLY;COUNT=4");
    }

    #[test]
    fn test_rrule_interval_and_until() {
        let r = Recurrence {
            frequency: Frequency::Monthly,
            interval: Some(2),
            count: None,
            until: NaiveDate::from_ymd_opt(2027, 3, 1),
        };
        assert_eq!(r.to_rrule(), "RRULE:FREQ=MONTHLY;INTERVAL=2;UNTIL=20270301");
    }

    #[test]
    fn test_rrule_count_wins_over_until() {
        let r = Recurrence {
            frequency: Frequency::Daily,
            interval: Some(1),
            count: Some(3),
            until: NaiveDate::from_ymd_opt(2027, 3, 1),
        };
        assert_eq!(r.to_rrule(), "RRULE:FREQ=DAILY;COUNT=3");
    }

    #[test]
    fn test_duration_of_timed_ref() {
        let target = EventRef {
            id: "e1".into(),
            summary: "Dentista".into(),
            start: at(2026, 10, 20, 9, 0),
            end: Some(at(2026, 10, 20, 10, 30)),
        };
        assert_eq!(target.duration(), Some(Duration::minutes(90)));
    }

    #[test]
    fn test_all_day_has_no_duration() {
        let day = NaiveDate::from_ymd_opt(2026, 10, 20).unwrap();
        let target = EventRef {
            id: "e1".into(),
            summary: "Ferie".into(),
            start: EventTime::AllDay(day),
            end: Some(EventTime::AllDay(day.succ_opt().unwrap())),
        };
        assert_eq!(target.duration(), None);
    }

    #[test]
    fn test_describe_create() {
        let request = CalendarActionRequest::Create(NewEvent {
            title: "Riunione".into(),
            start: at(2026, 10, 17, 15, 0),
            end: at(2026, 10, 17, 16, 0),
            location: Some("Ufficio".into()),
            description: None,
            participants: vec!["Alice".into()],
            recurrence: None,
        });
        let text = request.describe();
        assert!(text.contains("Nuovo evento: Riunione"));
        assert!(text.contains("Inizio: 17/10/2026 15:00"));
        assert!(text.contains("Luogo: Ufficio"));
        assert!(text.contains("Partecipanti: Alice"));
        assert!(!text.contains("Descrizione"));
    }
}
