use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use outreach_bridge::{BridgeConfig, BridgeTransport};
use outreach_core::{
    config::Config,
    connection::SessionManager,
    dispatcher::CampaignDispatcher,
    status::StatusBroadcaster,
    store::FileSessionStore,
    transport::Transport,
};
use outreach_http::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    outreach_core::logging::init("outreach")?;

    let cfg = Arc::new(Config::load()?);
    info!(
        session_dir = %cfg.session_dir.display(),
        bridge = %cfg.bridge_program.display(),
        "outreach relay starting"
    );

    let transport: Arc<dyn Transport> =
        Arc::new(BridgeTransport::new(BridgeConfig::from_config(&cfg)));
    let store = Arc::new(FileSessionStore::new(cfg.session_dir.clone()));
    let status = StatusBroadcaster::new(cfg.event_buffer);

    let session = SessionManager::new(transport.clone(), store, status, cfg.reconnect);
    let dispatcher = CampaignDispatcher::new(
        transport,
        &session,
        cfg.pacing,
        cfg.address_domain.clone(),
    );

    // Come back with stored credentials instead of waiting for a new code.
    if cfg.auto_resume {
        match session.resume().await {
            Ok(true) => info!("resuming stored session"),
            Ok(false) => info!("no stored session; POST /connect to pair"),
            Err(e) => warn!(error = %e, "failed to resume stored session"),
        }
    }

    let state = Arc::new(AppState::new(cfg, session.clone(), dispatcher.clone()));
    let served = outreach_http::run_server(state, shutdown_signal()).await;

    if let Some(id) = dispatcher.cancel() {
        info!(campaign = %id, "cancelled running campaign on shutdown");
    }
    served.context("http surface failed")?;
    info!(state = %session.state(), "outreach relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
