use std::sync::{Arc, Mutex};

use tracing::info;

use scripthost::script::ScriptDispatcher;
use scripthost::store::MemoryStore;
use scripthost::web::{create_router, AppState};
use scripthost::{Config, Database};

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::load("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            Config::default()
        }
    };

    // Initialize logging
    if let Err(e) = scripthost::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        scripthost::logging::init_console_only(&config.logging.level);
    }

    info!("scripthost - server script service");
    if !config.sandbox.enabled {
        info!("sandbox is disabled; script execution will be refused");
    }

    let db = match Database::open(&config.database.path) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Failed to open database: {e}");
            std::process::exit(1);
        }
    };

    let state = AppState {
        dispatcher: Arc::new(ScriptDispatcher::new(
            Arc::new(MemoryStore::new()),
            config.sandbox.clone(),
        )),
        db: Arc::new(Mutex::new(db)),
    };

    let router = create_router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Listening on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, router).await {
        eprintln!("Server error: {e}");
        std::process::exit(1);
    }
}
