use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::handler::{ChallengeRequest, Outcome};

/// What the responder did with one request
#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    pub request: ChallengeRequest,
    pub outcome: Outcome,
    pub status: u16,
    pub duration: Duration,
}

impl AccessLogEntry {
    /// The JSON object written as one line of the access log
    pub fn to_record(&self) -> Value {
        json!({
            "timestamp": self.request.received_at.to_rfc3339(),
            "client_ip": self.request.client.ip().to_string(),
            "method": self.request.method.as_str(),
            "path": self.request.path,
            "status": self.status,
            "duration_ms": self.duration.as_millis() as u64,
            "user_agent": self.request.user_agent,
            "outcome": self.outcome.as_str(),
            "probe": self.outcome == Outcome::Probe,
        })
    }
}

/// Cloneable handle to the access log file. Disabled handles drop entries.
#[derive(Debug, Clone, Default)]
pub struct AccessLog {
    tx: Option<mpsc::UnboundedSender<AccessLogEntry>>,
}

impl AccessLog {
    /// Start a writer for `path`, or return a disabled handle for `None`.
    /// Spawns onto the current tokio runtime.
    pub fn new(path: Option<PathBuf>) -> Self {
        let Some(path) = path else {
            return Self::disabled();
        };
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_records(path, rx));
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn record(&self, entry: AccessLogEntry) {
        if let Some(tx) = &self.tx {
            // writer gone means the file could not be opened; already warned
            let _ = tx.send(entry);
        }
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

/// Drains the channel in bursts, one flush per burst, until every handle is gone.
async fn write_records(path: PathBuf, mut rx: mpsc::UnboundedReceiver<AccessLogEntry>) {
    let mut out = match open_append(&path).await {
        Ok(file) => BufWriter::new(file),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Access log unavailable, requests are only traced");
            return;
        }
    };
    debug!(path = %path.display(), "Access log open");

    let mut batch = Vec::new();
    while let Some(first) = rx.recv().await {
        batch.clear();
        let mut next = Some(first);
        while let Some(entry) = next {
            if serde_json::to_writer(&mut batch, &entry.to_record()).is_ok() {
                batch.push(b'\n');
            }
            next = rx.try_recv().ok();
        }

        let written = match out.write_all(&batch).await {
            Ok(()) => out.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(path = %path.display(), error = %e, "Access log write failed");
        }
    }
}
