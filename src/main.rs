use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use segretario::chatbot::{
    ChatTransport, ChatbotEngine, Command, Database, EngineConfig, ExpenseLedger, SessionKey, TelegramClient,
    Utterance,
};
use segretario::claude::Client as ClaudeClient;
use segretario::config::Config;
use segretario::google::{CALENDAR_SCOPE, GoogleCalendar, GoogleSheets, SHEETS_SCOPE, ServiceAccount, TokenProvider};
use segretario::telegram_log::TelegramLogLayer;

/// Turns kept per session; older ones are pruned at startup.
const HISTORY_KEEP_FACTOR: usize = 10;

struct BotState {
    config: Config,
    engine: ChatbotEngine,
    denied: Mutex<HashSet<UserId>>,
}

impl BotState {
    /// Reply "access denied" once per stranger. Returns true if the user may proceed.
    async fn authorize(&self, bot: &Bot, user: &teloxide::types::User, chat_id: ChatId) -> bool {
        if self.config.is_owner(user.id) {
            return true;
        }
        let mut denied = self.denied.lock().await;
        if denied.insert(user.id) {
            info!("Denied access to {} ({})", user.first_name, user.id);
            bot.send_message(chat_id, "Accesso negato.").await.ok();
        }
        false
    }
}

fn fail(message: String) -> ! {
    error!("{}", message);
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "segretario.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing_subscriber::fmt().init();
            fail(format!("Failed to load {config_path}: {e}"));
        }
    };

    let bot = Bot::new(&config.telegram_bot_token);
    let transport = Arc::new(TelegramClient::new(bot.clone()));

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::never(&log_dir, "segretario.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let registry = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        );

    if let Some(log_chat_id) = config.log_chat_id {
        let tg_layer = TelegramLogLayer::new(transport.clone(), log_chat_id.0);
        registry.with(tg_layer).init();
    } else {
        registry.init();
    }

    info!("🚀 Starting segretario...");
    info!("Loaded config from {config_path}");
    info!("Owner IDs: {:?}", config.owner_ids);

    let bot_username = match bot.get_me().await {
        Ok(me) => {
            info!("Bot user ID: {}, username: @{}", me.id, me.username());
            me.username().to_string()
        }
        Err(e) => fail(format!("Failed to reach Telegram: {e}")),
    };

    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        warn!("Failed to register commands: {e}");
    }

    let tokens: Arc<dyn TokenProvider> =
        match ServiceAccount::from_file(&config.google_credentials_path, &[CALENDAR_SCOPE, SHEETS_SCOPE]) {
            Ok(account) => Arc::new(account),
            Err(e) => fail(format!("Google credentials: {e}")),
        };
    let calendar = Arc::new(GoogleCalendar::new(tokens.clone(), config.calendar_id.clone(), config.timezone));
    let ledger: Option<Arc<dyn ExpenseLedger>> = match config.spreadsheet_id {
        Some(ref id) => Some(Arc::new(GoogleSheets::new(tokens.clone(), id.clone(), config.worksheet_name.clone()))),
        None => {
            warn!("No spreadsheet_id configured, expense commands are disabled");
            None
        }
    };

    let mut llm = ClaudeClient::new(config.anthropic_api_key.clone(), config.llm_model.clone());
    if let Some(ref base_url) = config.llm_base_url {
        llm = llm.with_base_url(base_url.clone());
    }

    let database = match Database::open(&config.data_dir.join("history.db")) {
        Ok(db) => db,
        Err(e) => fail(format!("Failed to open history database: {e}")),
    };
    match database.prune(config.history_turns * HISTORY_KEEP_FACTOR) {
        Ok(0) => {}
        Ok(n) => info!("Pruned {} old turns", n),
        Err(e) => warn!("Failed to prune history: {e}"),
    }

    let engine = ChatbotEngine::new(
        EngineConfig {
            bot_username,
            timezone: config.timezone,
            expense_categories: config.expense_categories.clone(),
            upcoming_events_limit: config.upcoming_events_limit,
            history_turns: config.history_turns,
        },
        transport.clone(),
        Arc::new(llm),
        calendar,
        ledger,
        Arc::new(database),
    );

    if let Some(owner) = config.owner_ids.first() {
        transport.send_text(owner.0 as i64, "Segretario avviato.").await.ok();
    }

    let state = Arc::new(BotState {
        config,
        engine,
        denied: Mutex::new(HashSet::new()),
    });

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

async fn handle_message(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(ref user) = msg.from else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };
    if !state.authorize(&bot, user, msg.chat.id).await {
        return Ok(());
    }

    let username = user.username.as_deref().unwrap_or(&user.first_name);
    info!("📨 Message from {} ({})", username, user.id);

    let utterance = Utterance::new(
        SessionKey::new(msg.chat.id.0, user.id.0 as i64),
        msg.id.0 as i64,
        username,
        text,
        msg.date,
    );
    state.engine.handle_message(utterance).await;
    Ok(())
}

async fn handle_callback(bot: Bot, q: CallbackQuery, state: Arc<BotState>) -> ResponseResult<()> {
    if !state.config.is_owner(q.from.id) {
        bot.answer_callback_query(q.id.clone()).text("Accesso negato.").await.ok();
        return Ok(());
    }
    bot.answer_callback_query(q.id.clone()).await.ok();

    let (Some(data), Some(message)) = (q.data.as_deref(), q.message.as_ref()) else {
        return Ok(());
    };
    let session = SessionKey::new(message.chat().id.0, q.from.id.0 as i64);
    state
        .engine
        .handle_callback(session, message.id().0 as i64, data)
        .await;
    Ok(())
}
