//! AgentCom server entry point

use agentcom::{Hub, HubConfig};
use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("agentcom=info".parse()?),
        )
        .init();

    let config = HubConfig::parse();
    let port = config.port;
    info!(
        port,
        data_dir = %config.data_dir.display(),
        "starting agentcom hub"
    );

    let hub = Hub::open(config).await?;
    let cancel = CancellationToken::new();
    let background = hub.start_background(&cancel);

    let app = agentcom::http_api::create_app(hub.clone());
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    for handle in background {
        let _ = handle.await;
    }
    hub.shutdown().await;
    info!("agentcom hub stopped");
    Ok(())
}
