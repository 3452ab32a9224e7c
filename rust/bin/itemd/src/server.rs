//! Server lifecycle: owns the store and the HTTP listener.
//!
//! ```text
//! NotStarted ──start()──▶ Running ──shutdown()──▶ Draining ──▶ Stopped
//! ```
//!
//! Shutdown order is fixed: stop accepting, drain in-flight requests under a
//! deadline (cancelling whatever is left when it elapses), wait for the serve
//! task to end, and only then close the store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use itemd_core::{ServiceConfig, ServiceError};
use itemd_kv::{KVError, KVStore, RedbStore};

use crate::api;

/// How long the serve task gets to wind down after in-flight requests were
/// cancelled, before it is aborted outright.
const ABORT_GRACE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("server has not been started")]
    NotStarted,

    #[error("server is already running")]
    AlreadyStarted,

    #[error("server has already been shut down")]
    AlreadyStopped,

    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] KVError),

    #[error("serve task failed: {0}")]
    Serve(String),
}

/// Lifecycle phase of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    Running,
    Draining,
    Stopped,
}

/// Outcome of [`Server::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// True when every in-flight request finished before the deadline.
    pub drained: bool,
}

struct Running {
    store: Arc<RedbStore>,
    local_addr: SocketAddr,
    /// Stops the accept loop and starts the drain.
    stop: CancellationToken,
    /// Cancels requests still running after the drain deadline.
    abort: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

/// The item server: one store, one listener.
pub struct Server {
    config: ServiceConfig,
    phase: Phase,
    running: Option<Running>,
}

impl Server {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            phase: Phase::NotStarted,
            running: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Address the listener is bound to, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// The open store, once running.
    pub fn store(&self) -> Option<Arc<dyn KVStore>> {
        self.running
            .as_ref()
            .map(|r| Arc::clone(&r.store) as Arc<dyn KVStore>)
    }

    /// Open the store, bind the listener and start serving in the background.
    ///
    /// Returns the bound address (a `:0` port resolves to the real one).
    pub async fn start(&mut self) -> Result<SocketAddr, LifecycleError> {
        match self.phase {
            Phase::NotStarted => {}
            Phase::Running => return Err(LifecycleError::AlreadyStarted),
            Phase::Draining | Phase::Stopped => return Err(LifecycleError::AlreadyStopped),
        }

        let db_path = self.config.resolve_db_path();
        let store = Arc::new(RedbStore::open(&db_path)?);

        let (listener, local_addr) = match bind(&self.config.listen).await {
            Ok(bound) => bound,
            Err(e) => {
                if let Err(close_err) = store.close() {
                    warn!(error = %close_err, "failed to close store after bind error");
                }
                return Err(e);
            }
        };

        let stop = CancellationToken::new();
        let abort = CancellationToken::new();
        let app = api::build_app(Arc::clone(&store) as Arc<dyn KVStore>).layer(
            middleware::from_fn_with_state(abort.clone(), cancel_on_abort),
        );

        let signal = stop.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await
        });

        info!(addr = %local_addr, db = %db_path.display(), "server running");
        self.running = Some(Running {
            store,
            local_addr,
            stop,
            abort,
            task,
        });
        self.phase = Phase::Running;
        Ok(local_addr)
    }

    /// Stop accepting connections, drain in-flight requests for up to
    /// `deadline`, then close the store.
    ///
    /// The store is closed even when the serve task failed; the first error
    /// is returned.
    pub async fn shutdown(&mut self, deadline: Duration) -> Result<ShutdownReport, LifecycleError> {
        match self.phase {
            Phase::Running => {}
            Phase::NotStarted => return Err(LifecycleError::NotStarted),
            Phase::Draining | Phase::Stopped => return Err(LifecycleError::AlreadyStopped),
        }
        let Some(running) = self.running.take() else {
            return Err(LifecycleError::NotStarted);
        };

        self.phase = Phase::Draining;
        info!(?deadline, "draining in-flight requests");
        running.stop.cancel();

        let mut task = running.task;
        let (drained, served) = match tokio::time::timeout(deadline, &mut task).await {
            Ok(joined) => (true, serve_result(joined)),
            Err(_) => {
                warn!(?deadline, "drain deadline elapsed, aborting in-flight requests");
                running.abort.cancel();
                let served = match tokio::time::timeout(ABORT_GRACE, &mut task).await {
                    Ok(joined) => serve_result(joined),
                    Err(_) => {
                        warn!("serve task still running, aborting it");
                        task.abort();
                        match task.await {
                            Err(e) if e.is_cancelled() => Ok(()),
                            joined => serve_result(joined),
                        }
                    }
                };
                (false, served)
            }
        };
        info!("listener stopped");

        // Connection tasks spawned by the serve loop can outlive an aborted
        // serve task and still hold the store. `close` waits on the store's
        // write lock for their transactions, so it runs off the async workers.
        let store = running.store;
        let closed = match tokio::task::spawn_blocking(move || store.close()).await {
            Ok(result) => result.map_err(LifecycleError::from),
            Err(e) => Err(LifecycleError::Serve(e.to_string())),
        };
        self.phase = Phase::Stopped;
        info!(drained, "server stopped");

        served?;
        closed?;
        Ok(ShutdownReport { drained })
    }
}

async fn bind(addr: &str) -> Result<(TcpListener, SocketAddr), LifecycleError> {
    let bind_err = |source| LifecycleError::Bind {
        addr: addr.to_string(),
        source,
    };
    let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
    let local_addr = listener.local_addr().map_err(bind_err)?;
    Ok((listener, local_addr))
}

fn serve_result(joined: Result<std::io::Result<()>, JoinError>) -> Result<(), LifecycleError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(LifecycleError::Serve(e.to_string())),
        Err(e) => Err(LifecycleError::Serve(e.to_string())),
    }
}

/// Answer 503 for any request still running once `abort` is cancelled.
/// The handler future is dropped at its next await point, so a store
/// transaction already under way still commits or rolls back as a whole.
async fn cancel_on_abort(
    State(abort): State<CancellationToken>,
    req: Request,
    next: Next,
) -> Response {
    tokio::select! {
        resp = next.run(req) => resp,
        _ = abort.cancelled() => {
            ServiceError::Unavailable("server shutting down".into()).into_response()
        }
    }
}
