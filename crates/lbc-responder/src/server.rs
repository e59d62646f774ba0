use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::handler::{ResponderState, router};
use crate::logging::AccessLog;
use crate::store::{ChallengeStore, ProbeAllowlist};

/// How long in-flight connections get to finish once a stop is requested
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ResponderError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("responder task failed: {0}")]
    Task(String),
}

/// Challenge responder, fully populated before it is bound
pub struct ChallengeResponder {
    store: ChallengeStore,
    allowlist: ProbeAllowlist,
    access_log: AccessLog,
}

impl ChallengeResponder {
    pub fn new(store: ChallengeStore, allowlist: ProbeAllowlist) -> Self {
        Self {
            store,
            allowlist,
            access_log: AccessLog::disabled(),
        }
    }

    pub fn with_access_log(mut self, access_log: AccessLog) -> Self {
        self.access_log = access_log;
        self
    }

    /// Bind the listener and start serving in a background task
    pub async fn bind(self, addr: SocketAddr) -> Result<ResponderHandle, ResponderError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ResponderError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let tokens = self.store.len();
        let probes = self.allowlist.len();
        let state = Arc::new(ResponderState {
            store: self.store,
            allowlist: self.allowlist,
            access_log: self.access_log,
        });
        let app = router(state).into_make_service_with_connect_info::<SocketAddr>();

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
        });

        info!(
            addr = %local_addr,
            tokens,
            probe_addresses = probes,
            "Challenge responder listening"
        );

        Ok(ResponderHandle {
            local_addr,
            shutdown_tx,
            task: Some(task),
        })
    }
}

/// Running responder. Dropping the handle requests a stop without waiting
/// for it; [`ResponderHandle::stop`] waits until the port is released.
pub struct ResponderHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<io::Result<()>>>,
}

impl ResponderHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, drain in-flight requests, and release the port
    pub async fn stop(mut self) -> Result<(), ResponderError> {
        let _ = self.shutdown_tx.send(true);
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };

        let result = match tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await {
            Ok(Ok(served)) => served.map_err(ResponderError::Io),
            Ok(Err(join_error)) => Err(ResponderError::Task(join_error.to_string())),
            Err(_) => {
                warn!(addr = %self.local_addr, "Responder did not drain in time, aborting");
                task.abort();
                let _ = task.await;
                Ok(())
            }
        };

        info!(addr = %self.local_addr, "Challenge responder stopped");
        result
    }
}

impl Drop for ResponderHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.shutdown_tx.send(true);
        }
    }
}
