//! Date/time parsing and formatting in the user's timezone.

use chrono::{DateTime, LocalResult, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone};
use chrono_tz::Tz;

use crate::chatbot::action::EventTime;

const LOCAL_FORMATS: [&str; 5] = [
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%d/%m/%Y %H:%M",
];

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%d/%m/%Y"];

/// Parse a time as emitted by the model: "2026-01-25 15:00", a bare date
/// ("2026-01-25" becomes an all-day value) or RFC 3339 with an offset.
pub fn parse_event_time(input: &str, tz: Tz) -> Result<EventTime, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty time".to_string());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(EventTime::At(dt.with_timezone(&tz)));
    }

    for format in LOCAL_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return localize(naive, tz).map(EventTime::At);
        }
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(input, format) {
            return Ok(EventTime::AllDay(date));
        }
    }

    Err(format!("Invalid date format: '{input}'. Use YYYY-MM-DD HH:MM"))
}

/// Attach a timezone to a wall-clock time. Ambiguous times (DST fall-back)
/// resolve to the earlier instant; skipped times (DST spring-forward) fail.
pub fn localize(naive: NaiveDateTime, tz: Tz) -> Result<DateTime<Tz>, String> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Ok(dt),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest),
        LocalResult::None => Err(format!("{naive} does not exist in {tz}")),
    }
}

/// Parse a Google Calendar `start`/`end` object.
pub fn parse_google_time(date_time: Option<&str>, date: Option<&str>, tz: Tz) -> Option<EventTime> {
    if let Some(dt) = date_time {
        return DateTime::parse_from_rfc3339(dt)
            .ok()
            .map(|dt| EventTime::At(dt.with_timezone(&tz)));
    }
    date.and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .map(EventTime::AllDay)
}

/// Inverse of `parse_event_time` for minute-precision values. Wall-clock
/// times that occur twice (DST fall-back) keep their offset.
pub fn to_draft_string(time: &EventTime) -> String {
    match time {
        EventTime::At(dt) => match dt.timezone().from_local_datetime(&dt.naive_local()) {
            LocalResult::Ambiguous(..) => dt.to_rfc3339_opts(SecondsFormat::Secs, false),
            _ => dt.format("%Y-%m-%d %H:%M").to_string(),
        },
        EventTime::AllDay(d) => d.format("%Y-%m-%d").to_string(),
    }
}

pub fn format_datetime(dt: &DateTime<Tz>) -> String {
    dt.format("%d/%m/%Y %H:%M").to_string()
}

pub fn format_date(date: &NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}

/// Italian weekday name, used to anchor relative dates in the prompt.
pub fn weekday_name(date: &NaiveDate) -> &'static str {
    use chrono::{Datelike, Weekday};
    match date.weekday() {
        Weekday::Mon => "lunedì",
        Weekday::Tue => "martedì",
        Weekday::Wed => "mercoledì",
        Weekday::Thu => "giovedì",
        Weekday::Fri => "venerdì",
        Weekday::Sat => "sabato",
        Weekday::Sun => "domenica",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use chrono_tz::Europe::Rome;

    #[test]
    fn test_parse_local_datetime() {
        let t = parse_event_time("2026-10-17 15:00", Rome).unwrap();
        match t {
            EventTime::At(dt) => {
                assert_eq!(format_datetime(&dt), "17/10/2026 15:00");
                assert_eq!(dt.timezone(), Rome);
            }
            other => panic!("expected timed value, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_iso_t_separator() {
        let t = parse_event_time("2026-10-17T09:30", Rome).unwrap();
        assert_eq!(to_draft_string(&t), "2026-10-17 09:30");
    }

    #[test]
    fn test_parse_rfc3339_converts_to_zone() {
        let t = parse_event_time("2026-07-01T10:00:00Z", Rome).unwrap();
        let EventTime::At(dt) = t else { panic!("expected timed value") };
        // CEST is UTC+2
        assert_eq!(dt.hour(), 12);
    }

    #[test]
    fn test_parse_bare_date_is_all_day() {
        let t = parse_event_time("2026-12-25", Rome).unwrap();
        assert_eq!(t, EventTime::AllDay(NaiveDate::from_ymd_opt(2026, 12, 25).unwrap()));
    }

    #[test]
    fn test_parse_italian_date_order() {
        let t = parse_event_time("25/12/2026 20:00", Rome).unwrap();
        assert_eq!(to_draft_string(&t), "2026-12-25 20:00");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_event_time("", Rome).is_err());
        assert!(parse_event_time("tomorrow", Rome).is_err());
        assert!(parse_event_time("2026-13-01 10:00", Rome).is_err());
    }

    #[test]
    fn test_spring_forward_gap_rejected() {
        // 2026-03-29 02:30 does not exist in Europe/Rome
        assert!(parse_event_time("2026-03-29 02:30", Rome).is_err());
    }

    #[test]
    fn test_fall_back_picks_earlier() {
        let t = parse_event_time("2026-10-25 02:30", Rome).unwrap();
        let EventTime::At(dt) = t else { panic!("expected timed value") };
        assert_eq!(dt.format("%z").to_string(), "+0200");
    }

    #[test]
    fn test_draft_string_keeps_repeated_hour() {
        let later = Rome.with_ymd_and_hms(2026, 10, 25, 2, 30, 0).latest().unwrap();
        let draft = to_draft_string(&EventTime::At(later));
        assert_eq!(draft, "2026-10-25T02:30:00+01:00");
        assert_eq!(parse_event_time(&draft, Rome).unwrap(), EventTime::At(later));

        let plain = Rome.with_ymd_and_hms(2026, 10, 17, 15, 0, 0).unwrap();
        assert_eq!(to_draft_string(&EventTime::At(plain)), "2026-10-17 15:00");
    }

    #[test]
    fn test_google_time_prefers_datetime() {
        let t = parse_google_time(Some("2026-10-20T09:00:00+02:00"), Some("2026-10-20"), Rome).unwrap();
        assert!(!t.is_all_day());
        let d = parse_google_time(None, Some("2026-10-20"), Rome).unwrap();
        assert!(d.is_all_day());
        assert!(parse_google_time(None, None, Rome).is_none());
    }

    #[test]
    fn test_weekday_name() {
        let friday = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        assert_eq!(weekday_name(&friday), "venerdì");
    }
}
