use std::io::Write as _;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lorekeeper_core::agent::{AgentMessage, AgentProtocol, AgentRegistry};
use lorekeeper_core::agents::{CharacterAgent, MemoryAgent, SystemAgent};
use lorekeeper_core::config::Config;
use lorekeeper_core::llm::{HttpLLMBackend, LLMBackend};
use lorekeeper_core::memory::MemoryManager;
use lorekeeper_core::persona::Persona;
use lorekeeper_core::storage::PgStorageBackend;

const BOT_ID: &str = "lorekeeper";

fn run_migrations(database_url: &str) -> Result<()> {
    use diesel::prelude::*;
    use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
    pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

    let mut conn = diesel::PgConnection::establish(database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("migration failed: {e}"))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "lorekeeper_core=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("lorekeeper starting up");

    let config = Config::from_env()?;
    info!(llm_api_url = %config.llm_api_url, llm_model = %config.llm_model, "configuration loaded");

    run_migrations(&config.database_url)?;
    info!("database migrations applied");

    let llm: Arc<dyn LLMBackend> = Arc::new(HttpLLMBackend::new(
        config.llm_api_url.clone(),
        config.llm_api_key.clone(),
        config.llm_model.clone(),
        config.embedding_model.clone(),
    ));
    let storage = Arc::new(PgStorageBackend::new(&config.database_url)?);
    let memory = Arc::new(MemoryManager::new(BOT_ID, storage, llm.clone(), &config));

    let user_id = std::env::var("LOREKEEPER_USER_ID").unwrap_or_else(|_| "local-user".to_string());

    let mut registry = AgentRegistry::new();
    registry.register(Arc::new(MemoryAgent::new(
        user_id.clone(),
        memory.clone(),
        llm.clone(),
        config.recent_summaries,
    )));
    registry.register(Arc::new(CharacterAgent::new(llm.clone(), Persona::default())));
    let registry = Arc::new(registry);

    let system_agent = SystemAgent::new(user_id.clone(), registry, llm, memory, config.message_window);

    info!("lorekeeper is awake — type a message and press enter (Ctrl-D to quit)");

    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        line.clear();
        let bytes_read = stdin.read_line(&mut line)?;
        if bytes_read == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        let response = system_agent.invoke(AgentMessage::new(input)).await;
        if !response.success {
            warn!("turn failed: {:?}", response.error);
        }
        println!("{}", response.content);
    }

    info!("lorekeeper shutting down");
    Ok(())
}
