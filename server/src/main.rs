use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use chat_relay_server::chat::broadcast::{
    BroadcastTransport, MemoryBroadcastTransport, RedisBroadcastTransport,
};
use chat_relay_server::chat::presence::{MemoryPresenceStore, PresenceStore, RedisPresenceStore};
use chat_relay_server::chat::subscriber::spawn_subscriber;
use chat_relay_server::config::{generate_config_template, Backend, Config};
use chat_relay_server::ws::actor::KeepAlive;
use chat_relay_server::{routes, shutdown, state};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chat_relay_server=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(env_filter).init();
    }

    tracing::info!("Chat relay server v{} starting", env!("CARGO_PKG_VERSION"));

    // Shared presence + broadcast clients; no session can be served without them
    let presence: Arc<dyn PresenceStore>;
    let transport: Arc<dyn BroadcastTransport>;
    match config.backend {
        Backend::Redis => {
            tracing::info!("Connecting to Redis...");
            presence = Arc::new(RedisPresenceStore::connect(&config).await?);
            transport = Arc::new(RedisBroadcastTransport::connect(&config).await?);
        }
        Backend::Memory => {
            tracing::info!("Using in-process presence and broadcast (single instance)");
            presence = Arc::new(MemoryPresenceStore::new());
            transport = Arc::new(MemoryBroadcastTransport::new());
        }
    }

    let app_state = state::AppState::new(presence, transport)
        .with_keepalive(KeepAlive::from_config(&config));

    // Start the subscriber before accepting connections so no broadcast is missed
    let subscriber = spawn_subscriber(app_state.transport.clone(), app_state.registry.clone()).await?;

    let app = routes::build_router(app_state.clone());

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let stop_accepting = app_state.shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(stop_accepting.cancelled_owned())
        .await
    });

    shutdown::wait_for_signal().await;

    let deadline = Duration::from_secs(config.shutdown_timeout_secs);
    shutdown::shutdown(&app_state, Some(subscriber), deadline).await;

    match tokio::time::timeout(Duration::from_secs(1), server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "Server error"),
        Ok(Err(e)) => tracing::error!(error = %e, "Server task failed"),
        Err(_) => tracing::warn!("Listener did not stop in time"),
    }

    tracing::info!("Chat app exited");
    Ok(())
}
