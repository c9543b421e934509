//! `doit --daemon`: run the server in this process.

use std::sync::Arc;

use doit_core::audit::Logger;
use doit_core::capability::Registry;
use doit_core::config::Config;
use doit_daemon::Server;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Runs the daemon until idle timeout or a termination signal.
pub async fn run(config: &Config, registry: Arc<Registry>) -> i32 {
    let logger = match Logger::open(&config.audit.path) {
        Ok(logger) => Some(logger),
        Err(e) => {
            // Audit is best-effort: serve without it rather than refuse.
            warn!("audit disabled: {e}");
            None
        }
    };

    let server = Arc::new(Server::from_config(config, registry, logger));

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => return,
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(int) => int,
            Err(_) => return,
        };
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        signal_shutdown.cancel();
    });

    match server.run(shutdown).await {
        Ok(()) => 0,
        Err(e) => {
            error!("daemon: {e}");
            eprintln!("doit: daemon: {e}");
            2
        }
    }
}
