use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use webphone::application::{RelayRouter, RouterSettings};
use webphone::config::Config;
use webphone::domain::signaling::SessionRegistry;
use webphone::domain::telephony::TelephonyControl;
use webphone::domain::user::UserDirectory;
use webphone::infrastructure::{AriClient, InMemoryUserDirectory};
use webphone::interface::api::{build_router, init_metrics, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting webphone signaling relay");

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded: {:?}", config);

    // PBX control plane
    let telephony: Arc<dyn TelephonyControl> = Arc::new(AriClient::new(config.telephony.clone())?);
    info!("ARI client targeting {}", config.telephony.base_url);

    let users: Arc<dyn UserDirectory> =
        Arc::new(InMemoryUserDirectory::new(config.signaling.password_hash_cost));

    let registry = Arc::new(SessionRegistry::new());
    let relay = Arc::new(RelayRouter::new(
        registry,
        telephony,
        users.clone(),
        RouterSettings::from_config(&config),
    ));

    // Initialize metrics exporter
    info!("Initializing Prometheus metrics exporter");
    let prometheus_handle = init_metrics()?;

    let app = build_router(AppState { relay, users }, prometheus_handle);
    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    info!("Signaling server listening on {}", config.bind_address());

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down...");
        })
        .await?;

    Ok(())
}
