mod core;
mod logging;
mod proxy;
mod socket;

use radio_proto::config::Config;
use radio_proto::protocol::{Diagnostic, StateChange};
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    StateChange(StateChange),
    Diagnostic(Diagnostic),
    Log(String),
    Error(String),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(256);

    let log_path = logging::init(&radio_proto::platform::data_dir(), broadcast_tx.clone())?;
    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    // All external inputs funnel into DaemonCore
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<core::DaemonEvent>(256);

    let daemon_core = core::DaemonCore::new(config.clone(), broadcast_tx.clone(), event_tx.clone())
        .await?;
    let state_manager = daemon_core.state_manager();

    let clients = std::sync::Arc::new(socket::ClientRegistry::default());

    let _socket_handle = socket::start_server(
        config.http.bind_address.clone(),
        radio_proto::platform::DAEMON_TCP_PORT,
        state_manager,
        clients,
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    // Proxy-rewritten stream URLs point here
    let _proxy_handle = proxy::start_server(config.http.bind_address.clone(), config.http.proxy_port);

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(core::DaemonEvent::Shutdown).await;
        }
    });

    info!("Daemon initialised, running event loop");
    daemon_core.run(event_rx).await?;

    Ok(())
}
