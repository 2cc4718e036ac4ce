use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use courier_server::auth::jwt::{load_or_generate_jwt_secret, JwtVerifier};
use courier_server::chat::ChatProtocolHandler;
use courier_server::config::{generate_config_template, Config};
use courier_server::store::{ChatStore, SqliteStore};
use courier_server::{db, routes, state};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("courier_server=info"));
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(env_filter)
            .init();
    }

    tracing::info!("Courier server v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize SQLite database
    let db = db::init_db(&config.data_dir)?;

    // Load or generate JWT signing key (256-bit random, stored in data_dir)
    let jwt_secret = load_or_generate_jwt_secret(&config.data_dir)?;

    let settings = config.chat_settings();
    tracing::info!(
        cache_ttl_ms = settings.cache_ttl.as_millis() as u64,
        debounce_ms = settings.debounce.as_millis() as u64,
        denials = ?settings.denials,
        "Chat settings"
    );

    let store: Arc<dyn ChatStore> = Arc::new(SqliteStore::new(db));
    let chat = Arc::new(ChatProtocolHandler::new(
        store.clone(),
        Arc::new(JwtVerifier::new(jwt_secret.clone())),
        settings,
    ));

    let app_state = state::AppState {
        chat: chat.clone(),
        store,
        jwt_secret: Arc::new(jwt_secret),
    };

    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(routes::shutdown_signal(tokio::signal::ctrl_c(), chat))
    .await?;

    tracing::info!("Server stopped");
    Ok(())
}
