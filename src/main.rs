mod config;
mod dispatcher;
mod envelope;
mod error;
mod gate;
mod graph;
mod handlers;
mod models;
mod state;
mod subscriptions;
mod token;

use std::{sync::Arc, time::Duration};

use axum::http::Uri;
use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{
    config::Config,
    dispatcher::{Dispatcher, TracingSink},
    envelope::EnvelopeDecoder,
    gate::NotificationGate,
    graph::{GraphApi, HttpGraphClient},
    handlers::router,
    state::AppState,
    subscriptions::{SubscriptionManager, SubscriptionSettings},
    token::{TokenVerifier, GRAPH_PUBLISHER_APP_ID},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = Arc::new(Config::from_env()?);
    ensure_secure_webhook_url(&cfg.webhook_url)?;
    // Missing or unreadable key is fatal: encrypted payloads could never be read.
    let decoder = Arc::new(EnvelopeDecoder::from_file(&cfg.private_key_path)?);

    let api: Arc<dyn GraphApi> = Arc::new(HttpGraphClient::new(&cfg)?);
    let verifier = TokenVerifier::new(
        api.clone(),
        cfg.app_id.clone(),
        GRAPH_PUBLISHER_APP_ID,
        Duration::from_secs(cfg.signing_key_cache_secs),
    );
    let gate = Arc::new(NotificationGate::new(verifier, cfg.client_state.clone()));
    let subscriptions = Arc::new(SubscriptionManager::new(
        api.clone(),
        SubscriptionSettings::from_config(&cfg),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        gate.clone(),
        decoder,
        subscriptions.clone(),
        api,
        Arc::new(TracingSink),
        cfg.recreate_on_removed,
    ));

    let state = AppState {
        subscriptions,
        gate,
        dispatcher,
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    info!(
        bind_addr = %cfg.bind_addr,
        notification_url = %cfg.notification_url(),
        "listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

// Graph only delivers to https endpoints; plain http is allowed for local tunnels.
fn ensure_secure_webhook_url(value: &str) -> anyhow::Result<()> {
    let uri: Uri = match value.parse() {
        Ok(uri) => uri,
        Err(_) => {
            anyhow::bail!("WEBHOOK_URL is not a valid URL");
        }
    };

    let host = uri.host().unwrap_or("");
    let is_localhost = matches!(host, "localhost" | "127.0.0.1" | "::1");
    let scheme = uri.scheme_str().unwrap_or("");
    if !scheme.eq_ignore_ascii_case("https") && !is_localhost {
        anyhow::bail!("WEBHOOK_URL must be https for non-localhost deployments");
    }

    Ok(())
}
