use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};
use wagate_core::{MemorySessionStore, PgSessionStore, SessionStore, WagateConfig};

use wagate_server::http::{self, HttpState};
use wagate_server::rate_limit;
use wagate_server::subsystems::{
    restore_authenticated_sessions, BridgeDriverFactory, SessionManager, SessionSettings,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "wagate.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience — production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match WagateConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    // Connect to DB, or fall back to the in-memory store
    let store: Arc<dyn SessionStore> = match &config.database {
        Some(db_config) => {
            let pool = match wagate_core::db::create_pool(db_config).await {
                Ok(p) => p,
                Err(e) => {
                    eprintln!("Failed to connect to database: {}", e);
                    std::process::exit(1);
                }
            };

            if args.health {
                match wagate_core::db::health_check(&pool).await {
                    Ok(v) => println!("✅ PostgreSQL connected: {}", v),
                    Err(e) => {
                        println!("❌ PostgreSQL connection failed: {}", e);
                        std::process::exit(1);
                    }
                }

                match wagate_core::db::check_users_table(&pool).await {
                    Ok(n) => println!("✅ users table present ({} rows)", n),
                    Err(e) => {
                        println!("❌ users table check failed: {}", e);
                        std::process::exit(1);
                    }
                }

                println!("✅ wagate DB health check passed");
                return Ok(());
            }

            Arc::new(PgSessionStore::new(pool))
        }
        None => {
            if args.health {
                println!("❌ No [database] section configured");
                std::process::exit(1);
            }
            tracing::warn!("No [database] configured, using in-memory session store");
            Arc::new(MemorySessionStore::new())
        }
    };

    let factory = Arc::new(BridgeDriverFactory::from(&config.bridge));
    let sessions = SessionManager::new(
        store.clone(),
        factory,
        SessionSettings::from(&config.sessions),
    );

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    if config.sessions.restore_on_startup {
        if let Err(e) = restore_authenticated_sessions(&sessions, store.as_ref()).await {
            tracing::error!("Session restore failed: {}", e);
        }
    }

    let state = Arc::new(HttpState {
        store,
        sessions: sessions.clone(),
        limiter: rate_limit::from_config(&config.rate_limit),
    });

    let result = http::start_http_server(state, &config.http, tx.subscribe()).await;

    sessions.shutdown().await;
    result
}
