//! Daemon orchestrator for wiring together all components.
//!
//! The orchestrator builds the shared context (output hub, session registry
//! and message router), creates the default session and runs the selected
//! transports until a stop signal arrives or the stdio client goes away.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::router::MessageRouter;
use crate::session::{OutputHub, SessionOptions, SessionRegistry};
use crate::transport::{stdio, UnixServer, WsServer};

/// How long listener tasks get to wind down after cancellation.
const LISTENER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Creating the default session and binding listeners.
    Starting,
    /// Serving clients.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// The transports to serve.
///
/// Standard I/O is exclusive; the WebSocket and Unix listeners may run
/// together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transports {
    pub stdio: bool,
    pub ws: Option<SocketAddr>,
    pub unix: Option<PathBuf>,
}

impl Transports {
    pub fn is_empty(&self) -> bool {
        !self.stdio && self.ws.is_none() && self.unix.is_none()
    }
}

/// Daemon orchestrator that owns the shared context.
pub struct DaemonOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    registry: Arc<SessionRegistry>,
    router: Arc<MessageRouter>,
    shutdown_token: CancellationToken,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator. No session exists until [`run`](Self::run).
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let hub = Arc::new(OutputHub::new());
        let registry = SessionRegistry::new(&config, hub);
        let router = Arc::new(MessageRouter::new(Arc::clone(&registry)));

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            router,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Runs the daemon until `stop` resolves, a listener fails, or the stdio
    /// client closes its input. Every session is closed before returning.
    pub async fn run<F>(&self, transports: Transports, stop: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if transports.is_empty() {
            anyhow::bail!("No transport selected");
        }
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }

        let result = match self.start(&transports).await {
            Ok(mut tasks) => {
                *self.state.write().await = OrchestratorState::Running;
                let outcome = tokio::select! {
                    _ = stop => {
                        info!("Shutdown requested");
                        Ok(())
                    }
                    Some(joined) = tasks.join_next() => match joined {
                        Ok(result) => result,
                        Err(e) => Err(anyhow!("Transport task failed: {}", e)),
                    },
                };
                self.stop_listeners(tasks).await;
                outcome
            }
            Err(e) => Err(e),
        };

        self.close_sessions().await;
        *self.state.write().await = OrchestratorState::Stopped;
        info!("Daemon stopped");
        result
    }

    /// Creates the default session and binds every selected listener.
    async fn start(&self, transports: &Transports) -> Result<JoinSet<Result<()>>> {
        let registry = Arc::clone(&self.registry);
        let session = tokio::task::spawn_blocking(move || registry.create(SessionOptions::default()))
            .await
            .context("Default session task panicked")?
            .context("Failed to create default session")?;
        info!(
            session_id = %session.id(),
            pane_id = %session.pane_id(),
            "Default session ready"
        );

        let queue = self.config.transport.outbound_queue;
        let mut tasks = JoinSet::new();

        if transports.stdio {
            let router = Arc::clone(&self.router);
            let token = self.shutdown_token.child_token();
            tasks.spawn(async move {
                stdio::serve(router, queue, token).await?;
                info!("Standard input closed");
                Ok(())
            });
        }

        if let Some(addr) = transports.ws {
            let server = WsServer::bind(addr)
                .await
                .with_context(|| format!("Failed to bind WebSocket listener on {}", addr))?;
            let router = Arc::clone(&self.router);
            let token = self.shutdown_token.child_token();
            tasks.spawn(async move {
                server
                    .run(router, queue, token)
                    .await
                    .context("WebSocket listener failed")
            });
        }

        if let Some(path) = &transports.unix {
            let server = UnixServer::bind(path)
                .with_context(|| format!("Failed to bind Unix socket at {}", path.display()))?;
            let router = Arc::clone(&self.router);
            let token = self.shutdown_token.child_token();
            tasks.spawn(async move {
                server
                    .run(router, queue, token)
                    .await
                    .context("Unix listener failed")
            });
        }

        Ok(tasks)
    }

    async fn stop_listeners(&self, mut tasks: JoinSet<Result<()>>) {
        *self.state.write().await = OrchestratorState::ShuttingDown;
        self.shutdown_token.cancel();

        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Err(e)) => warn!(error = %e, "Transport stopped with error"),
                    Err(e) => warn!(error = %e, "Transport task failed"),
                    Ok(Ok(())) => {}
                }
            }
        };
        if tokio::time::timeout(LISTENER_SHUTDOWN_TIMEOUT, drain).await.is_err() {
            warn!("Transports did not stop in time, aborting");
            tasks.abort_all();
        }
    }

    async fn close_sessions(&self) {
        let registry = Arc::clone(&self.registry);
        let count = registry.len();
        if let Err(e) = tokio::task::spawn_blocking(move || registry.close_all()).await {
            warn!(error = %e, "Session teardown panicked");
        }
        debug!(count, "Sessions closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn create_test_config() -> Config {
        let mut config = Config::default();
        config.session.default_shell = "/bin/sh".to_string();
        config.transport.poll_interval_ms = 20;
        config
    }

    #[test]
    fn test_orchestrator_rejects_invalid_config() {
        let mut config = create_test_config();
        config.session.cols = 0;
        assert!(DaemonOrchestrator::new(config).is_err());
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.registry().is_empty());
    }

    #[tokio::test]
    async fn test_run_requires_a_transport() {
        let orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();
        let result = orchestrator.run(Transports::default(), async {}).await;
        assert!(result.is_err());
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[serial]
    async fn test_run_and_stop_unix() {
        let temp_dir = TempDir::new().unwrap();
        let socket = temp_dir.path().join("cmuxd.sock");
        let orchestrator = Arc::new(DaemonOrchestrator::new(create_test_config()).unwrap());

        let stop = CancellationToken::new();
        let task = {
            let orchestrator = Arc::clone(&orchestrator);
            let stop = stop.clone();
            let transports = Transports {
                unix: Some(socket.clone()),
                ..Default::default()
            };
            tokio::spawn(async move {
                orchestrator
                    .run(transports, async move { stop.cancelled().await })
                    .await
            })
        };

        let mut running = false;
        for _ in 0..100 {
            if orchestrator.state().await == OrchestratorState::Running {
                running = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(running);
        assert!(socket.exists());
        assert_eq!(orchestrator.registry().len(), 1);

        stop.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.registry().is_empty());
        assert!(!socket.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[serial]
    async fn test_bind_failure_closes_default_session() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = blocker.local_addr().unwrap();
        let orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();

        let transports = Transports {
            ws: Some(taken),
            ..Default::default()
        };
        let result = orchestrator.run(transports, std::future::pending()).await;

        assert!(result.is_err());
        assert!(orchestrator.registry().is_empty());
    }
}
