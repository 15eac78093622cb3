//! TCR Game Server
//!
//! Entry point: initialize logging, load persistence, serve until
//! interrupted. Exits non-zero when the listener cannot bind or the
//! data directory is unusable.

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tcr_server::{GameServer, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();
    info!("TCR server v{VERSION}");
    info!(
        "bind address {}, data directory {}",
        config.bind_addr,
        config.data_dir.display()
    );

    let server = match GameServer::new(config).await {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("startup failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping server");
                server.shutdown();
            }
        });
    }

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("server error: {e}");
            ExitCode::FAILURE
        }
    }
}
