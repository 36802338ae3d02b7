//! Verify Google credentials: list upcoming events and this month's expenses.
//!
//! Usage: cargo run --bin google_check [segretario.json]

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};

use segretario::chatbot::executor::{CalendarProvider, format_event_list};
use segretario::chatbot::expenses::{ExpenseLedger, Period, Report};
use segretario::config::Config;
use segretario::google::{CALENDAR_SCOPE, GoogleCalendar, GoogleSheets, SHEETS_SCOPE, ServiceAccount, TokenProvider};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "segretario.json".to_string());
    if let Err(e) = run(&config_path).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;
    let account = ServiceAccount::from_file(&config.google_credentials_path, &[CALENDAR_SCOPE, SHEETS_SCOPE])?;
    info!("Authenticating as {}", account.client_email());
    let tokens: Arc<dyn TokenProvider> = Arc::new(account);

    let calendar = GoogleCalendar::new(tokens.clone(), config.calendar_id.clone(), config.timezone);
    let events = calendar.upcoming(config.upcoming_events_limit).await?;
    println!("{}", format_event_list(&events));

    match config.spreadsheet_id {
        Some(ref id) => {
            let sheets = GoogleSheets::new(tokens, id.clone(), config.worksheet_name.clone());
            let expenses = sheets.expenses().await?;
            let today = Utc::now().with_timezone(&config.timezone).date_naive();
            println!("{}", Report::build(&expenses, Period::Month, None, today).render());
        }
        None => println!("No spreadsheet_id configured, skipping expenses."),
    }
    Ok(())
}
