//! Engine flow tests against in-memory transport, calendar, ledger and model.
//!
//! Run with: cargo test chatbot

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Europe::Rome;

use super::action::{EventChanges, EventSummary, EventTime, NewEvent};
use super::database::Database;
use super::engine::{CANCEL, CONFIRM, ChatbotEngine, EngineConfig};
use super::executor::CalendarProvider;
use super::expenses::{Expense, ExpenseLedger};
use super::message::{SessionKey, Utterance};
use super::session::DialogState;
use super::telegram::{Button, ChatTransport, TransportError};
use crate::claude::{self, LanguageModel, Message};
use crate::google::GoogleError;

// =============================================================================
// TEST DOUBLES
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Sent {
    Text(String),
    Buttons(String, Vec<Vec<Button>>),
    Edit(i64, String),
}

#[derive(Default)]
struct MockTransport {
    sent: Mutex<Vec<Sent>>,
}

impl MockTransport {
    fn take(&self) -> Vec<Sent> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    fn push(&self, sent: Sent) -> i64 {
        let mut all = self.sent.lock().unwrap();
        all.push(sent);
        100 + all.len() as i64
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn send_text(&self, _chat_id: i64, text: &str) -> Result<i64, TransportError> {
        Ok(self.push(Sent::Text(text.to_string())))
    }

    async fn send_with_buttons(&self, _chat_id: i64, text: &str, rows: Vec<Vec<Button>>) -> Result<i64, TransportError> {
        Ok(self.push(Sent::Buttons(text.to_string(), rows)))
    }

    async fn edit_text(&self, _chat_id: i64, message_id: i64, text: &str) -> Result<(), TransportError> {
        self.push(Sent::Edit(message_id, text.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct MockCalendar {
    events: Vec<EventSummary>,
    calls: Mutex<Vec<String>>,
}

impl MockCalendar {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CalendarProvider for MockCalendar {
    async fn upcoming(&self, max_results: u32) -> Result<Vec<EventSummary>, GoogleError> {
        Ok(self.events.iter().take(max_results as usize).cloned().collect())
    }

    async fn insert(&self, event: &NewEvent) -> Result<EventSummary, GoogleError> {
        self.calls.lock().unwrap().push(format!("insert {} {}", event.title, event.start.display()));
        Ok(EventSummary {
            id: "new".into(),
            summary: event.title.clone(),
            start: event.start,
            end: Some(event.end),
            location: event.location.clone(),
            description: event.description.clone(),
        })
    }

    async fn patch(&self, event_id: &str, changes: &EventChanges) -> Result<EventSummary, GoogleError> {
        let end = changes.end.map(|e| e.display()).unwrap_or_default();
        self.calls.lock().unwrap().push(format!("patch {event_id} end={end}"));
        let mut event = self
            .events
            .iter()
            .find(|e| e.id == event_id)
            .cloned()
            .ok_or(GoogleError::Api { status: 404, body: "not found".into() })?;
        if let Some(start) = changes.start {
            event.start = start;
        }
        Ok(event)
    }

    async fn delete(&self, event_id: &str) -> Result<(), GoogleError> {
        self.calls.lock().unwrap().push(format!("delete {event_id}"));
        Ok(())
    }
}

#[derive(Default)]
struct MockLedger {
    expenses: Mutex<Vec<Expense>>,
}

#[async_trait]
impl ExpenseLedger for MockLedger {
    async fn append(&self, expense: &Expense) -> Result<(), GoogleError> {
        self.expenses.lock().unwrap().push(expense.clone());
        Ok(())
    }

    async fn expenses(&self) -> Result<Vec<Expense>, GoogleError> {
        Ok(self.expenses.lock().unwrap().clone())
    }
}

/// Replies from a script, in order. Counts calls.
#[derive(Default)]
struct ScriptedModel {
    replies: Mutex<Vec<String>>,
    calls: Mutex<usize>,
}

impl ScriptedModel {
    fn push(&self, reply: &str) {
        self.replies.lock().unwrap().insert(0, reply.to_string());
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, _system: &str, _messages: &[Message], _max_tokens: u32) -> Result<String, claude::Error> {
        *self.calls.lock().unwrap() += 1;
        self.replies.lock().unwrap().pop().ok_or(claude::Error::Empty)
    }
}

// =============================================================================
// FIXTURE
// =============================================================================

const CHAT: i64 = 42;
const USER: i64 = 7;

fn fixed_now() -> DateTime<Utc> {
    // Friday 2026-10-16 10:00 in Rome
    Utc.with_ymd_and_hms(2026, 10, 16, 8, 0, 0).unwrap()
}

fn at(d: u32, h: u32, m: u32) -> EventTime {
    EventTime::At(Rome.with_ymd_and_hms(2026, 10, d, h, m, 0).unwrap())
}

fn event(id: &str, summary: &str, start: EventTime, end: EventTime) -> EventSummary {
    EventSummary {
        id: id.into(),
        summary: summary.into(),
        start,
        end: Some(end),
        location: None,
        description: None,
    }
}

struct Harness {
    engine: ChatbotEngine,
    transport: Arc<MockTransport>,
    calendar: Arc<MockCalendar>,
    ledger: Arc<MockLedger>,
    model: Arc<ScriptedModel>,
    database: Arc<Database>,
}

impl Harness {
    fn new() -> Self {
        Self::build(true)
    }

    fn build(with_ledger: bool) -> Self {
        let transport = Arc::new(MockTransport::default());
        let calendar = Arc::new(MockCalendar {
            events: vec![
                event("e1", "Dentist appointment", at(20, 9, 0), at(20, 10, 30)),
                event("e2", "Doctor appointment", at(21, 15, 0), at(21, 15, 30)),
                event("e3", "Cena con Marco", at(22, 20, 0), at(22, 22, 0)),
            ],
            calls: Mutex::new(Vec::new()),
        });
        let ledger = Arc::new(MockLedger::default());
        let model = Arc::new(ScriptedModel::default());
        let database = Arc::new(Database::new().unwrap());
        let engine = ChatbotEngine::new(
            EngineConfig {
                bot_username: "segretario_bot".into(),
                timezone: Rome,
                expense_categories: vec!["Cibo".into(), "Trasporti".into(), "Casa".into(), "Svago".into()],
                upcoming_events_limit: 10,
                history_turns: 10,
            },
            transport.clone(),
            model.clone(),
            calendar.clone(),
            with_ledger.then(|| ledger.clone() as Arc<dyn ExpenseLedger>),
            database.clone(),
        )
        .with_clock(fixed_now);
        Self { engine, transport, calendar, ledger, model, database }
    }

    fn session() -> SessionKey {
        SessionKey::new(CHAT, USER)
    }

    async fn say(&self, text: &str) -> Vec<Sent> {
        let utterance = Utterance::new(Self::session(), 1, "alice", text, fixed_now());
        self.engine.handle_message(utterance).await;
        self.transport.take()
    }

    async fn press(&self, message_id: i64, data: &str) -> Vec<Sent> {
        self.engine.handle_callback(Self::session(), message_id, data).await;
        self.transport.take()
    }

    async fn state(&self) -> DialogState {
        self.engine.state(Self::session()).await
    }
}

fn texts(sent: &[Sent]) -> Vec<&str> {
    sent.iter()
        .map(|s| match s {
            Sent::Text(t) | Sent::Buttons(t, _) | Sent::Edit(_, t) => t.as_str(),
        })
        .collect()
}

fn button_data(sent: &Sent) -> Vec<Vec<&str>> {
    match sent {
        Sent::Buttons(_, rows) => rows.iter().map(|r| r.iter().map(|b| b.data.as_str()).collect()).collect(),
        other => panic!("expected buttons, got {other:?}"),
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

mod commands {
    use super::*;

    #[tokio::test]
    async fn test_help_lists_commands() {
        let h = Harness::new();
        let sent = h.say("/help").await;
        let text = texts(&sent)[0];
        assert!(text.contains("/spesa"));
        assert!(text.contains("/report_settimana"));
        assert!(text.contains("/cancella_evento"));
    }

    #[tokio::test]
    async fn test_command_addressed_to_bot() {
        let h = Harness::new();
        let sent = h.say("/spesa@segretario_bot").await;
        assert_eq!(texts(&sent), vec!["Quanto hai speso? (es. 12,50)"]);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let h = Harness::new();
        let sent = h.say("/teletrasporto").await;
        assert!(texts(&sent)[0].contains("Comando sconosciuto"));
        assert_eq!(h.model.calls(), 0);
    }

    #[tokio::test]
    async fn test_eventi_lists_upcoming() {
        let h = Harness::new();
        let sent = h.say("/eventi").await;
        let text = texts(&sent)[0];
        assert!(text.contains("1. Dentist appointment - 20/10/2026 09:00"));
        assert!(text.contains("3. Cena con Marco"));
    }

    #[tokio::test]
    async fn test_cancel_from_any_state() {
        let h = Harness::new();
        h.say("/spesa").await;
        assert_eq!(h.state().await, DialogState::ExpenseAmount);
        assert_eq!(texts(&h.say("/cancel").await), vec!["Operazione annullata."]);
        assert_eq!(h.state().await, DialogState::Idle);
        assert_eq!(texts(&h.say("/cancel").await), vec!["Nessuna operazione in corso."]);
    }

    #[tokio::test]
    async fn test_skip_outside_description() {
        let h = Harness::new();
        h.say("/spesa").await;
        assert_eq!(texts(&h.say("/skip").await), vec!["Non c'è niente da saltare."]);
        assert_eq!(h.state().await, DialogState::ExpenseAmount);
    }
}

// =============================================================================
// EXPENSES
// =============================================================================

mod expenses {
    use super::*;

    #[tokio::test]
    async fn test_wizard_with_buttons_and_skip() {
        let h = Harness::new();
        h.say("/spesa").await;

        let sent = h.say("dieci").await;
        assert!(texts(&sent)[0].contains("Importo non valido"));
        assert_eq!(h.state().await, DialogState::ExpenseAmount);

        let sent = h.say("12,50").await;
        assert!(texts(&sent)[0].starts_with("Importo: 12.50€"));
        assert_eq!(button_data(&sent[0]), vec![vec!["cat:0", "cat:1", "cat:2"], vec!["cat:3"]]);

        let sent = h.press(101, "cat:1").await;
        assert_eq!(sent[0], Sent::Edit(101, "Categoria: Trasporti".into()));
        assert_eq!(texts(&sent)[1], "Aggiungi una descrizione, oppure /skip.");

        let sent = h.say("/skip").await;
        assert_eq!(texts(&sent), vec!["✅ Spesa registrata: 12.50€ in Trasporti"]);
        let saved = h.ledger.expenses.lock().unwrap().clone();
        assert_eq!(
            saved,
            vec![Expense {
                date: NaiveDate::from_ymd_opt(2026, 10, 16).unwrap(),
                amount: 12.5,
                category: "Trasporti".into(),
                description: None,
            }]
        );
        assert_eq!(h.state().await, DialogState::Idle);
    }

    #[tokio::test]
    async fn test_wizard_typed_category_and_description() {
        let h = Harness::new();
        h.say("/spesa").await;
        h.say("8").await;
        assert!(texts(&h.say("Viaggi").await)[0].contains("Categoria non valida"));
        h.say("cibo").await;
        let sent = h.say("pizza con amici").await;
        assert_eq!(texts(&sent), vec!["✅ Spesa registrata: 8.00€ in Cibo (pizza con amici)"]);
        let saved = h.ledger.expenses.lock().unwrap();
        assert_eq!(saved[0].description.as_deref(), Some("pizza con amici"));
    }

    #[tokio::test]
    async fn test_wizard_never_reaches_interpreter() {
        let h = Harness::new();
        h.say("/spesa").await;
        h.say("5").await;
        h.say("Casa").await;
        h.say("domani alle 10 dentista").await;
        assert_eq!(h.model.calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_category_button() {
        let h = Harness::new();
        let sent = h.press(5, "cat:0").await;
        assert_eq!(sent, vec![Sent::Edit(5, "Richiesta scaduta.".into())]);
        assert!(h.ledger.expenses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expenses_disabled_without_ledger() {
        let h = Harness::build(false);
        assert_eq!(texts(&h.say("/spesa").await), vec!["Il registro spese non è configurato."]);
        assert_eq!(texts(&h.say("/report").await), vec!["Il registro spese non è configurato."]);
    }

    fn seed(h: &Harness) {
        let mut expenses = h.ledger.expenses.lock().unwrap();
        for (day, amount, category) in [(16, 10.0, "Cibo"), (13, 4.0, "Trasporti"), (1, 30.0, "Casa")] {
            expenses.push(Expense {
                date: NaiveDate::from_ymd_opt(2026, 10, day).unwrap(),
                amount,
                category: category.into(),
                description: None,
            });
        }
    }

    #[tokio::test]
    async fn test_reports_by_period() {
        let h = Harness::new();
        seed(&h);
        let sent = h.say("/report_settimana").await;
        assert!(texts(&sent)[0].contains("Totale: 14.00€ (2 spese)"));

        let sent = h.say("/report").await;
        assert!(texts(&sent)[0].contains("Totale: 44.00€ (3 spese)"));
        assert!(texts(&sent)[0].contains("• Casa: 30.00€"));

        let sent = h.say("/report_giorno").await;
        assert!(texts(&sent)[0].contains("Totale: 10.00€"));
    }

    #[tokio::test]
    async fn test_report_with_period_and_category_args() {
        let h = Harness::new();
        seed(&h);
        let sent = h.say("/report anno casa").await;
        let text = texts(&sent)[0];
        assert!(text.contains("di quest'anno per Casa"));
        assert!(text.contains("Totale: 30.00€"));
        assert!(!text.contains("Per categoria"));

        let sent = h.say("/report_mese Svago").await;
        assert_eq!(texts(&sent), vec!["Nessuna spesa di questo mese per Svago."]);

        let sent = h.say("/report_anno Viaggi").await;
        assert!(texts(&sent)[0].starts_with("Categoria sconosciuta: Viaggi"));
    }
}

// =============================================================================
// CALENDAR DIALOGUE
// =============================================================================

mod calendar {
    use super::*;

    #[tokio::test]
    async fn test_create_confirm_applies() {
        let h = Harness::new();
        h.model.push(r#"{"intent": "create", "title": "Meeting with Alice", "start": "2026-10-17 15:00"}"#);

        let sent = h.say("add a meeting with Alice tomorrow at 3pm").await;
        assert_eq!(sent.len(), 1);
        assert!(texts(&sent)[0].contains("Nuovo evento: Meeting with Alice"));
        assert!(texts(&sent)[0].contains("Fine: 17/10/2026 16:00"));
        assert_eq!(button_data(&sent[0]), vec![vec![CONFIRM, CANCEL]]);
        // Nothing is written before confirmation
        assert!(h.calendar.calls().is_empty());

        let sent = h.press(101, CONFIRM).await;
        assert_eq!(h.calendar.calls(), vec!["insert Meeting with Alice 17/10/2026 15:00"]);
        assert!(texts(&sent)[0].contains("✅ Evento creato: Meeting with Alice"));
        assert_eq!(h.state().await, DialogState::Idle);
    }

    #[tokio::test]
    async fn test_cancel_button_discards() {
        let h = Harness::new();
        h.model.push(r#"{"intent": "delete", "target": {"event_ids": ["e3"]}}"#);
        h.say("cancella la cena").await;
        let sent = h.press(101, CANCEL).await;
        assert!(texts(&sent)[0].ends_with("Annullato."));
        assert!(h.calendar.calls().is_empty());

        // A second press finds nothing pending
        let sent = h.press(101, CONFIRM).await;
        assert_eq!(sent, vec![Sent::Edit(101, "Richiesta scaduta.".into())]);
        assert!(h.calendar.calls().is_empty());
    }

    #[tokio::test]
    async fn test_text_while_confirming_keeps_action() {
        let h = Harness::new();
        h.model.push(r#"{"intent": "delete", "target": {"event_ids": ["e3"]}}"#);
        h.say("cancella la cena").await;
        let sent = h.say("e quindi?").await;
        assert!(texts(&sent)[0].contains("Conferma o Annulla"));
        assert!(matches!(h.state().await, DialogState::Confirming(_)));
        assert_eq!(h.model.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_time_then_answer() {
        let h = Harness::new();
        h.model.push(r#"{"intent": "create", "title": "Meeting"}"#);
        let sent = h.say("schedule a meeting").await;
        assert_eq!(texts(&sent), vec!["Mi serve ancora: data e ora di inizio."]);
        assert!(matches!(h.state().await, DialogState::Clarifying(_)));

        h.model.push(r#"{"intent": "create", "start": "2026-10-19 09:30"}"#);
        let sent = h.say("lunedì alle 9 e mezza").await;
        assert!(texts(&sent)[0].contains("Nuovo evento: Meeting"));
        assert!(texts(&sent)[0].contains("Inizio: 19/10/2026 09:30"));
    }

    #[tokio::test]
    async fn test_ambiguous_delete_pick_button() {
        let h = Harness::new();
        h.model.push(r#"{"intent": "delete", "target": {"query": "my appointment"}}"#);
        let sent = h.say("cancel my appointment").await;
        assert!(texts(&sent)[0].contains("1. Dentist appointment"));
        assert_eq!(button_data(&sent[0]), vec![vec!["pick:1", "pick:2"]]);

        let sent = h.press(101, "pick:2").await;
        assert!(texts(&sent)[1].contains("Elimina: Doctor appointment"));
        assert_eq!(h.model.calls(), 1);

        h.press(102, CONFIRM).await;
        assert_eq!(h.calendar.calls(), vec!["delete e2"]);
    }

    #[tokio::test]
    async fn test_modifica_evento_flow() {
        let h = Harness::new();
        let sent = h.say("/modifica_evento").await;
        assert!(texts(&sent)[0].starts_with("Quale evento intendi?"));
        assert_eq!(button_data(&sent[0]), vec![vec!["pick:1", "pick:2", "pick:3"]]);

        let sent = h.say("1").await;
        assert_eq!(texts(&sent), vec!["Mi serve ancora: cosa modificare."]);
        assert_eq!(h.model.calls(), 0);

        h.model.push(r#"{"intent": "update", "start": "2026-10-23 11:00"}"#);
        let sent = h.say("spostalo a venerdì alle 11").await;
        assert!(texts(&sent)[0].contains("Modifica: Dentist appointment"));
        assert!(texts(&sent)[0].contains("Nuova fine: 23/10/2026 12:30"));

        h.press(101, CONFIRM).await;
        assert_eq!(h.calendar.calls(), vec!["patch e1 end=23/10/2026 12:30"]);
    }

    #[tokio::test]
    async fn test_evento_seeds_create_draft() {
        let h = Harness::new();
        let sent = h.say("/evento").await;
        assert!(texts(&sent)[0].starts_with("Descrivi l'evento"));

        h.model.push(r#"{"intent": "create", "title": "Palestra", "start": "2026-10-19 18:00", "end": "2026-10-19 19:30"}"#);
        let sent = h.say("palestra lunedì 18-19:30").await;
        assert!(texts(&sent)[0].contains("Fine: 19/10/2026 19:30"));
    }

    #[tokio::test]
    async fn test_off_topic_gets_fallback() {
        let h = Harness::new();
        h.model.push(r#"{"intent": "unrelated", "reason": "weather"}"#);
        let sent = h.say("che tempo fa domani?").await;
        assert!(texts(&sent)[0].starts_with("Non ho capito"));
        assert_eq!(h.state().await, DialogState::Idle);
    }

    #[tokio::test]
    async fn test_model_failure_keeps_question_open() {
        let h = Harness::new();
        h.model.push(r#"{"intent": "create", "title": "Meeting"}"#);
        h.say("schedule a meeting").await;

        // No scripted reply left: the model call fails
        let sent = h.say("domani alle 10").await;
        assert!(texts(&sent)[0].contains("riprova"));
        assert!(matches!(h.state().await, DialogState::Clarifying(_)));
        assert!(h.calendar.calls().is_empty());
    }

    #[tokio::test]
    async fn test_turns_are_recorded() {
        let h = Harness::new();
        h.model.push(r#"{"intent": "create", "title": "Meeting"}"#);
        h.say("schedule a meeting").await;
        let turns = h.database.recent_turns(Harness::session(), 10).unwrap();
        let texts: Vec<_> = turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["schedule a meeting", "Mi serve ancora: data e ora di inizio."]);
    }
}
