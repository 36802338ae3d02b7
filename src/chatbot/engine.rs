//! Chatbot engine: commands, the expense wizard and the calendar dialogue.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use teloxide::utils::command::BotCommands;
use tracing::{debug, error, info, warn};

use crate::chatbot::action::CalendarActionRequest;
use crate::chatbot::database::Database;
use crate::chatbot::executor::{CalendarProvider, Executor, format_event_list};
use crate::chatbot::expenses::{Expense, ExpenseLedger, Period, Report, match_category, parse_amount};
use crate::chatbot::intent::{
    ClarificationRequest, InterpretError, Interpretation, Interpreter, InterpreterInput, candidates_question,
};
use crate::chatbot::message::{SessionKey, Speaker, Turn, Utterance};
use crate::chatbot::schema::{ActionDraft, CreateDraft, DeleteDraft, Field, UpdateDraft};
use crate::chatbot::session::{DialogState, Sessions};
use crate::chatbot::telegram::{Button, ChatTransport};
use crate::claude::LanguageModel;

/// Callback data of the confirmation buttons.
pub const CONFIRM: &str = "act:confirm";
pub const CANCEL: &str = "act:cancel";
const CATEGORY_PREFIX: &str = "cat:";
const PICK_PREFIX: &str = "pick:";

const CATEGORIES_PER_ROW: usize = 3;
const CANDIDATES_PER_ROW: usize = 5;

const FALLBACK: &str = "Non ho capito. Posso creare, modificare o cancellare eventi del calendario, \
    ad esempio \"domani alle 15 riunione con Alice\" o \"sposta il dentista a lunedì alle 10\". \
    Per le spese usa /spesa.";

/// Bot commands.
#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "snake_case", description = "Comandi disponibili:")]
pub enum Command {
    #[command(description = "avvia il bot")]
    Start,
    #[command(description = "mostra questo aiuto")]
    Help,
    #[command(description = "registra una spesa")]
    Spesa,
    #[command(description = "report del mese, o: /report settimana Cibo", parse_with = rest_of_line)]
    Report(String),
    #[command(description = "report di oggi", parse_with = rest_of_line)]
    ReportGiorno(String),
    #[command(description = "report della settimana", parse_with = rest_of_line)]
    ReportSettimana(String),
    #[command(description = "report del mese", parse_with = rest_of_line)]
    ReportMese(String),
    #[command(description = "report dell'anno", parse_with = rest_of_line)]
    ReportAnno(String),
    #[command(description = "crea un evento")]
    Evento,
    #[command(description = "mostra i prossimi eventi")]
    Eventi,
    #[command(description = "modifica un evento")]
    ModificaEvento,
    #[command(description = "cancella un evento")]
    CancellaEvento,
    #[command(description = "salta la descrizione della spesa")]
    Skip,
    #[command(description = "annulla l'operazione in corso")]
    Cancel,
}

fn rest_of_line(input: String) -> Result<(String,), teloxide::utils::command::ParseError> {
    Ok((input.trim().to_string(),))
}

/// Engine settings taken from the config.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bot_username: String,
    pub timezone: Tz,
    pub expense_categories: Vec<String>,
    pub upcoming_events_limit: u32,
    pub history_turns: usize,
}

/// The chatbot engine.
pub struct ChatbotEngine {
    config: EngineConfig,
    transport: Arc<dyn ChatTransport>,
    interpreter: Interpreter,
    executor: Executor,
    ledger: Option<Arc<dyn ExpenseLedger>>,
    database: Arc<Database>,
    sessions: Sessions,
    clock: fn() -> DateTime<Utc>,
}

impl ChatbotEngine {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn ChatTransport>,
        model: Arc<dyn LanguageModel>,
        calendar: Arc<dyn CalendarProvider>,
        ledger: Option<Arc<dyn ExpenseLedger>>,
        database: Arc<Database>,
    ) -> Self {
        let interpreter = Interpreter::new(model, config.timezone);
        Self {
            config,
            transport,
            interpreter,
            executor: Executor::new(calendar),
            ledger,
            database,
            sessions: Sessions::new(),
            clock: Utc::now,
        }
    }

    /// Replace the wall clock, for tests.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Tz> {
        (self.clock)().with_timezone(&self.config.timezone)
    }

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }

    pub async fn state(&self, session: SessionKey) -> DialogState {
        self.sessions.get(session).await
    }

    async fn send(&self, chat_id: i64, text: &str) -> Option<i64> {
        match self.transport.send_text(chat_id, text).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!("Failed to reply in chat {}: {}", chat_id, e);
                None
            }
        }
    }

    async fn send_buttons(&self, chat_id: i64, text: &str, rows: Vec<Vec<Button>>) -> Option<i64> {
        match self.transport.send_with_buttons(chat_id, text, rows).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!("Failed to send keyboard in chat {}: {}", chat_id, e);
                None
            }
        }
    }

    async fn edit(&self, chat_id: i64, message_id: i64, text: &str) {
        if let Err(e) = self.transport.edit_text(chat_id, message_id, text).await {
            warn!("Failed to edit message {}: {}", message_id, e);
        }
    }

    fn record(&self, session: SessionKey, speaker: Speaker, text: &str, timestamp: DateTime<Utc>) {
        let turn = Turn { session, speaker, text: text.to_string(), timestamp };
        if let Err(e) = self.database.add_turn(&turn) {
            warn!("Failed to store turn: {}", e);
        }
    }

    /// Handle a text message from an authorized user.
    pub async fn handle_message(&self, utterance: Utterance) {
        let session = utterance.session();
        let text = utterance.text().trim();
        if text.is_empty() {
            return;
        }

        if text.starts_with('/') {
            match Command::parse(text, &self.config.bot_username) {
                Ok(command) => self.handle_command(session, command).await,
                Err(e) => {
                    debug!("Unparsed command {:?}: {}", text, e);
                    self.send(session.chat_id, "Comando sconosciuto. Usa /help per l'elenco dei comandi.")
                        .await;
                }
            }
            return;
        }

        match self.sessions.take(session).await {
            DialogState::ExpenseAmount => self.expense_amount(session, text).await,
            DialogState::ExpenseCategory { amount } => self.expense_category_typed(session, amount, text).await,
            DialogState::ExpenseDescription { amount, category } => {
                self.save_expense(session, amount, category, Some(text.to_string())).await
            }
            DialogState::Confirming(action) => {
                self.sessions.set(session, DialogState::Confirming(action)).await;
                self.send(session.chat_id, "Usa i pulsanti Conferma o Annulla, oppure /cancel.").await;
            }
            DialogState::Clarifying(pending) => self.interpret(&utterance, Some(pending)).await,
            DialogState::Idle => self.interpret(&utterance, None).await,
        }
    }

    /// Handle an inline keyboard press on `message_id`.
    pub async fn handle_callback(&self, session: SessionKey, message_id: i64, data: &str) {
        let chat_id = session.chat_id;
        let state = self.sessions.take(session).await;
        info!("Callback {:?} in state {:?}", data, state_name(&state));

        match (data, state) {
            (CONFIRM, DialogState::Confirming(action)) => {
                let summary = action.describe();
                let outcome = match self.executor.apply(&action).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("Calendar action failed: {}", e);
                        "❌ Operazione non riuscita, il calendario ha risposto con un errore. Riprova più tardi."
                            .to_string()
                    }
                };
                self.edit(chat_id, message_id, &format!("{summary}\n{outcome}")).await;
                self.record(session, Speaker::Bot, &outcome, (self.clock)());
            }
            (CANCEL, DialogState::Confirming(action)) => {
                self.edit(chat_id, message_id, &format!("{}\nAnnullato.", action.describe())).await;
            }
            (CONFIRM | CANCEL, other) => {
                self.sessions.set(session, other).await;
                self.edit(chat_id, message_id, "Richiesta scaduta.").await;
            }
            (data, DialogState::ExpenseCategory { amount }) if data.starts_with(CATEGORY_PREFIX) => {
                let category = data[CATEGORY_PREFIX.len()..]
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| self.config.expense_categories.get(i))
                    .cloned();
                match category {
                    Some(category) => {
                        self.edit(chat_id, message_id, &format!("Categoria: {category}")).await;
                        self.ask_description(session, amount, category).await;
                    }
                    None => {
                        self.sessions.set(session, DialogState::ExpenseCategory { amount }).await;
                        self.send(chat_id, "Categoria non valida, scegline una dall'elenco.").await;
                    }
                }
            }
            (data, DialogState::Clarifying(pending)) if data.starts_with(PICK_PREFIX) => {
                let pick = &data[PICK_PREFIX.len()..];
                self.edit(chat_id, message_id, &format!("{}\nScelta: {pick}", pending.question)).await;
                let utterance = Utterance::new(session, message_id, "", pick, (self.clock)());
                self.interpret(&utterance, Some(pending)).await;
            }
            (_, other) => {
                self.sessions.set(session, other).await;
                self.edit(chat_id, message_id, "Richiesta scaduta.").await;
            }
        }
    }

    async fn handle_command(&self, session: SessionKey, command: Command) {
        let chat_id = session.chat_id;
        info!("Command {:?} from {}", command, session.user_id);
        match command {
            Command::Start | Command::Help => {
                self.sessions.set(session, DialogState::Idle).await;
                let text = format!(
                    "Ciao! Scrivimi cosa fare col calendario in linguaggio naturale, \
                     ad esempio \"giovedì alle 18 palestra\".\n\n{}",
                    Command::descriptions()
                );
                self.send(chat_id, &text).await;
            }
            Command::Spesa => {
                if self.ledger.is_none() {
                    self.send(chat_id, "Il registro spese non è configurato.").await;
                    return;
                }
                self.sessions.set(session, DialogState::ExpenseAmount).await;
                self.send(chat_id, "Quanto hai speso? (es. 12,50)").await;
            }
            Command::Report(args) => self.report(chat_id, Period::Month, &args, true).await,
            Command::ReportGiorno(args) => self.report(chat_id, Period::Day, &args, false).await,
            Command::ReportSettimana(args) => self.report(chat_id, Period::Week, &args, false).await,
            Command::ReportMese(args) => self.report(chat_id, Period::Month, &args, false).await,
            Command::ReportAnno(args) => self.report(chat_id, Period::Year, &args, false).await,
            Command::Evento => {
                let pending = ClarificationRequest {
                    missing: vec![Field::Title, Field::Start],
                    candidates: Vec::new(),
                    question: "Descrivi l'evento: titolo, giorno e ora (e se vuoi luogo e partecipanti).".to_string(),
                    draft: Some(ActionDraft::Create(CreateDraft::default())),
                };
                self.send(chat_id, &pending.question).await;
                self.sessions.set(session, DialogState::Clarifying(pending)).await;
            }
            Command::Eventi => {
                self.sessions.set(session, DialogState::Idle).await;
                match self.executor.calendar().upcoming(self.config.upcoming_events_limit).await {
                    Ok(events) => {
                        self.send(chat_id, &format_event_list(&events)).await;
                    }
                    Err(e) => {
                        error!("Failed to list events: {}", e);
                        self.send(chat_id, "❌ Non riesco a leggere il calendario.").await;
                    }
                }
            }
            Command::ModificaEvento => {
                self.seed_target_choice(session, ActionDraft::Update(UpdateDraft::default())).await
            }
            Command::CancellaEvento => {
                self.seed_target_choice(session, ActionDraft::Delete(DeleteDraft::default())).await
            }
            Command::Skip => match self.sessions.take(session).await {
                DialogState::ExpenseDescription { amount, category } => {
                    self.save_expense(session, amount, category, None).await
                }
                other => {
                    self.sessions.set(session, other).await;
                    self.send(chat_id, "Non c'è niente da saltare.").await;
                }
            },
            Command::Cancel => {
                let text = match self.sessions.take(session).await {
                    DialogState::Idle => "Nessuna operazione in corso.",
                    _ => "Operazione annullata.",
                };
                self.send(chat_id, text).await;
            }
        }
    }

    /// Start an update or delete by listing upcoming events to pick from.
    async fn seed_target_choice(&self, session: SessionKey, draft: ActionDraft) {
        let chat_id = session.chat_id;
        self.sessions.set(session, DialogState::Idle).await;
        let events = match self.executor.calendar().upcoming(self.config.upcoming_events_limit).await {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to list events: {}", e);
                self.send(chat_id, "❌ Non riesco a leggere il calendario.").await;
                return;
            }
        };
        if events.is_empty() {
            self.send(chat_id, "Nessun evento in programma.").await;
            return;
        }
        let pending = ClarificationRequest {
            missing: vec![Field::Target],
            question: candidates_question(&events),
            candidates: events,
            draft: Some(draft),
        };
        self.ask(session, pending).await;
    }

    /// Send a clarification question, with number buttons when there are candidates.
    async fn ask(&self, session: SessionKey, pending: ClarificationRequest) {
        if pending.candidates.is_empty() {
            self.send(session.chat_id, &pending.question).await;
        } else {
            let buttons: Vec<Button> = (1..=pending.candidates.len())
                .map(|n| Button::new(n.to_string(), format!("{PICK_PREFIX}{n}")))
                .collect();
            let rows = buttons.chunks(CANDIDATES_PER_ROW).map(<[Button]>::to_vec).collect();
            self.send_buttons(session.chat_id, &pending.question, rows).await;
        }
        self.record(session, Speaker::Bot, &pending.question, (self.clock)());
        self.sessions.set(session, DialogState::Clarifying(pending)).await;
    }

    async fn interpret(&self, utterance: &Utterance, pending: Option<ClarificationRequest>) {
        let session = utterance.session();
        let chat_id = session.chat_id;

        let events = match self.executor.calendar().upcoming(self.config.upcoming_events_limit).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Could not fetch upcoming events, interpreting without them: {}", e);
                Vec::new()
            }
        };
        let history = self
            .database
            .recent_turns(session, self.config.history_turns)
            .unwrap_or_else(|e| {
                warn!("Failed to load history: {}", e);
                Vec::new()
            });
        self.record(session, Speaker::User, utterance.text(), utterance.received_at());

        let result = self
            .interpreter
            .interpret(InterpreterInput {
                utterance,
                history: &history,
                events: &events,
                pending: pending.as_ref(),
                now: self.now(),
            })
            .await;

        match result {
            Ok(Interpretation::Action(action)) => self.confirm(session, action).await,
            Ok(Interpretation::Clarify(clarification)) => {
                info!("Asking for {:?}", clarification.missing);
                self.ask(session, clarification).await;
            }
            Err(InterpretError::UnresolvableIntent { reason }) => {
                info!("Not a calendar request: {}", reason);
                self.send(chat_id, FALLBACK).await;
                self.record(session, Speaker::Bot, FALLBACK, (self.clock)());
            }
            Err(e) => {
                error!("Interpretation failed: {}", e);
                // Keep the open question so the user can simply retry
                if let Some(pending) = pending {
                    self.sessions.set(session, DialogState::Clarifying(pending)).await;
                }
                self.send(chat_id, "⚠️ Non sono riuscito a elaborare la richiesta, riprova tra poco.").await;
            }
        }
    }

    async fn confirm(&self, session: SessionKey, action: CalendarActionRequest) {
        let text = format!("{}\nConfermi?", action.describe());
        let rows = vec![vec![Button::new("✅ Conferma", CONFIRM), Button::new("❌ Annulla", CANCEL)]];
        self.send_buttons(session.chat_id, &text, rows).await;
        self.record(session, Speaker::Bot, &text, (self.clock)());
        self.sessions.set(session, DialogState::Confirming(action)).await;
    }

    async fn expense_amount(&self, session: SessionKey, text: &str) {
        let Some(amount) = parse_amount(text) else {
            self.sessions.set(session, DialogState::ExpenseAmount).await;
            self.send(session.chat_id, "Importo non valido. Scrivi un numero positivo, es. 12,50").await;
            return;
        };
        let buttons: Vec<Button> = self
            .config
            .expense_categories
            .iter()
            .enumerate()
            .map(|(i, c)| Button::new(c.clone(), format!("{CATEGORY_PREFIX}{i}")))
            .collect();
        let rows = buttons.chunks(CATEGORIES_PER_ROW).map(<[Button]>::to_vec).collect();
        self.sessions.set(session, DialogState::ExpenseCategory { amount }).await;
        self.send_buttons(session.chat_id, &format!("Importo: {amount:.2}€\nScegli la categoria:"), rows)
            .await;
    }

    async fn expense_category_typed(&self, session: SessionKey, amount: f64, text: &str) {
        match match_category(text, &self.config.expense_categories) {
            Some(category) => self.ask_description(session, amount, category.to_string()).await,
            None => {
                self.sessions.set(session, DialogState::ExpenseCategory { amount }).await;
                self.send(session.chat_id, "Categoria non valida, scegline una dall'elenco.").await;
            }
        }
    }

    async fn ask_description(&self, session: SessionKey, amount: f64, category: String) {
        self.sessions
            .set(session, DialogState::ExpenseDescription { amount, category })
            .await;
        self.send(session.chat_id, "Aggiungi una descrizione, oppure /skip.").await;
    }

    async fn save_expense(&self, session: SessionKey, amount: f64, category: String, description: Option<String>) {
        let chat_id = session.chat_id;
        let Some(ref ledger) = self.ledger else {
            self.send(chat_id, "Il registro spese non è configurato.").await;
            return;
        };
        let expense = Expense { date: self.today(), amount, category, description };
        match ledger.append(&expense).await {
            Ok(()) => {
                let mut text = format!("✅ Spesa registrata: {:.2}€ in {}", expense.amount, expense.category);
                if let Some(ref description) = expense.description {
                    text.push_str(&format!(" ({description})"));
                }
                self.send(chat_id, &text).await;
            }
            Err(e) => {
                error!("Failed to record expense: {}", e);
                self.send(chat_id, "❌ Non sono riuscito a salvare la spesa, riprova con /spesa.").await;
            }
        }
    }

    async fn report(&self, chat_id: i64, period: Period, args: &str, period_from_args: bool) {
        let Some(ref ledger) = self.ledger else {
            self.send(chat_id, "Il registro spese non è configurato.").await;
            return;
        };

        let mut period = period;
        let mut rest = args.trim();
        if period_from_args {
            let (first, tail) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            if let Some(p) = Period::parse(first) {
                period = p;
                rest = tail.trim();
            }
        }
        let category = if rest.is_empty() {
            None
        } else {
            match match_category(rest, &self.config.expense_categories) {
                Some(c) => Some(c),
                None => {
                    let text = format!(
                        "Categoria sconosciuta: {rest}. Categorie: {}",
                        self.config.expense_categories.join(", ")
                    );
                    self.send(chat_id, &text).await;
                    return;
                }
            }
        };

        match ledger.expenses().await {
            Ok(expenses) => {
                let report = Report::build(&expenses, period, category, self.today());
                self.send(chat_id, &report.render()).await;
            }
            Err(e) => {
                error!("Failed to read expenses: {}", e);
                self.send(chat_id, "❌ Non riesco a leggere il registro spese.").await;
            }
        }
    }
}

fn state_name(state: &DialogState) -> &'static str {
    match state {
        DialogState::Idle => "idle",
        DialogState::ExpenseAmount => "expense_amount",
        DialogState::ExpenseCategory { .. } => "expense_category",
        DialogState::ExpenseDescription { .. } => "expense_description",
        DialogState::Clarifying(_) => "clarifying",
        DialogState::Confirming(_) => "confirming",
    }
}
