//! The daemon server: socket lifecycle and the accept loop.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use doit_core::audit::Logger;
use doit_core::capability::Registry;
use doit_core::config::Config;
use doit_core::ipc;
use doit_core::llm::ClaudeClient;
use doit_core::policy::{
    default_store_path, level2_from_store, Level1, Level3, PolicyEngine, TokenStore,
    DEFAULT_TOKEN_TTL,
};
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pidfile::{self, StaleSocketError};

/// How often expired approval tokens are swept.
const TOKEN_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Daemon startup and serve failures.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Socket directory or listener setup failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A live daemon already owns the socket.
    #[error(transparent)]
    AlreadyRunning(#[from] StaleSocketError),
}

/// The persistent daemon process serving IPC connections.
pub struct Server {
    pub(crate) registry: Arc<Registry>,
    pub(crate) logger: Option<Arc<Logger>>,
    pub(crate) policy: PolicyEngine,
    pub(crate) tokens: TokenStore,
    idle_timeout: Duration,
}

impl Server {
    /// Creates a server over explicit collaborators. Tests use this to
    /// inject a fake gatekeeper or no policy at all.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        logger: Option<Logger>,
        policy: PolicyEngine,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            logger: logger.map(Arc::new),
            policy,
            tokens: TokenStore::new(DEFAULT_TOKEN_TTL),
            idle_timeout,
        }
    }

    /// Builds the production server from config: Level 1 from the config
    /// rules, Level 2 from the learned store when enabled (a load failure
    /// disables the level with a warning), and Level 3 over the `claude`
    /// subprocess client.
    #[must_use]
    pub fn from_config(config: &Config, registry: Arc<Registry>, logger: Option<Logger>) -> Self {
        let level1 = config
            .policy
            .level1_enabled
            .then(|| Level1::new(&config.effective_rules()));

        let level2 = if config.policy.level2_enabled {
            let path = config
                .policy
                .level2_path
                .clone()
                .unwrap_or_else(default_store_path);
            match level2_from_store(&path) {
                Ok(level2) => Some(level2),
                Err(e) => {
                    warn!("failed to load learned policy: {e}");
                    None
                }
            }
        } else {
            None
        };

        let level3 = Some(Level3::new(Box::new(ClaudeClient::new())));

        Self::new(
            registry,
            logger,
            PolicyEngine::new(level1, level2, level3),
            config.daemon.idle_timeout(),
        )
    }

    /// Creates the socket at the standard path and serves until `shutdown`
    /// fires or the idle timer expires. The socket and PID file are removed
    /// on the way out.
    ///
    /// # Errors
    ///
    /// [`DaemonError::AlreadyRunning`] when a live daemon holds the socket,
    /// or any I/O failure during setup.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), DaemonError> {
        let socket_path = ipc::socket_path()?;
        let pid_path = ipc::pid_path()?;

        if let Some(dir) = socket_path.parent() {
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(dir)?;
            }
            #[cfg(not(unix))]
            std::fs::create_dir_all(dir)?;
        }

        pidfile::clean_stale_socket(&socket_path, &pid_path).await?;

        let listener = UnixListener::bind(&socket_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        }
        pidfile::write_pid_file(&pid_path)?;
        info!(socket = %socket_path.display(), "doit daemon listening");

        let result = self.serve(listener, shutdown).await;

        let _ = std::fs::remove_file(&socket_path);
        pidfile::remove_pid_file(&pid_path);
        result.map_err(DaemonError::Io)
    }

    /// Accepts connections on `listener` until `shutdown` fires or the
    /// idle timer does. Exported separately so tests can serve on a
    /// temporary socket.
    ///
    /// The idle deadline resets whenever a connection is accepted or
    /// completes; if it expires with no active connections, the loop
    /// returns cleanly.
    ///
    /// # Errors
    ///
    /// An accept failure other than shutdown.
    pub async fn serve(
        self: Arc<Self>,
        listener: UnixListener,
        shutdown: CancellationToken,
    ) -> io::Result<()> {
        // Background sweep of expired approval tokens.
        let purge_cancel = shutdown.child_token();
        let purge_server = Arc::clone(&self);
        let purger = tokio::spawn(async move {
            let mut tick = tokio::time::interval(TOKEN_PURGE_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = purge_cancel.cancelled() => return,
                    _ = tick.tick() => purge_server.tokens.purge(),
                }
            }
        });

        let mut connections: JoinSet<()> = JoinSet::new();
        let mut deadline = tokio::time::Instant::now() + self.idle_timeout;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("daemon shutting down");
                    break;
                }

                accepted = listener.accept() => {
                    let (stream, _addr) = accepted?;
                    debug!("connection accepted");
                    deadline = tokio::time::Instant::now() + self.idle_timeout;

                    let server = Arc::clone(&self);
                    let cancel = shutdown.child_token();
                    connections.spawn(async move {
                        server.handle_connection(stream, cancel).await;
                    });
                }

                Some(_finished) = connections.join_next(), if !connections.is_empty() => {
                    debug!("connection completed");
                    deadline = tokio::time::Instant::now() + self.idle_timeout;
                }

                () = tokio::time::sleep_until(deadline) => {
                    if connections.is_empty() {
                        info!("idle timeout, shutting down");
                        break;
                    }
                    deadline = tokio::time::Instant::now() + self.idle_timeout;
                }
            }
        }

        // Drain in-flight connections; their child scopes are already
        // cancelled on the shutdown path.
        while connections.join_next().await.is_some() {}
        purger.abort();
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream, cancel: CancellationToken) {
        crate::connection::handle(self, stream, cancel).await;
    }
}
