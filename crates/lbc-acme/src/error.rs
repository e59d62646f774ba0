use lbc_responder::ResponderError;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::client::ClientOutput;

/// Errors from the lower layers (credentials, filesystem)
#[derive(Error, Debug)]
pub enum AcmeError {
    #[error("DNS credentials error: {0}")]
    Credentials(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

pub type AcmeResult<T> = Result<T, AcmeError>;

/// Orchestration state, used to tell the operator where a run stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    ServerStarted,
    Waiting,
    Holding,
    ExternalClientRunning,
    Publishing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::ServerStarted => "server-started",
            Self::Waiting => "waiting",
            Self::Holding => "holding",
            Self::ExternalClientRunning => "external-client",
            Self::Publishing => "publishing",
        })
    }
}

/// File-by-file result of a failed publication
#[derive(Error, Debug, Clone, Default)]
#[error(
    "artifact publication to {} incomplete; copied: [{}]; failed: [{}]",
    .dest.display(),
    .copied.join(", "),
    failed_list(.failed)
)]
pub struct PublishError {
    pub dest: PathBuf,
    pub copied: Vec<String>,
    pub failed: Vec<(String, String)>,
}

fn failed_list(failed: &[(String, String)]) -> String {
    failed
        .iter()
        .map(|(name, reason)| format!("{name}: {reason}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Error, Debug)]
pub enum IssuanceError {
    #[error("invalid request: {0}")]
    Config(String),

    #[error("cannot start challenge responder: {0}")]
    Bind(#[source] ResponderError),

    #[error(
        "{url} not reachable after {elapsed:?}; check the load balancer backend set, \
         its health check and the listener forwarding to this port"
    )]
    ReadinessTimeout { url: String, elapsed: Duration },

    #[error("operator input closed while holding for confirmation")]
    HoldInputClosed,

    #[error("certificate client failed (exit status {})", .0.status_text())]
    ExternalClient(ClientOutput),

    #[error(transparent)]
    Publish(PublishError),

    #[error("interrupted during {stage}")]
    Interrupted { stage: Stage },

    #[error("IO error during {stage}: {source}")]
    Io {
        stage: Stage,
        #[source]
        source: io::Error,
    },
}

impl IssuanceError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Config(_) | Self::Bind(_) => Stage::Init,
            Self::ReadinessTimeout { .. } => Stage::Waiting,
            Self::HoldInputClosed => Stage::Holding,
            Self::ExternalClient(_) => Stage::ExternalClientRunning,
            Self::Publish(_) => Stage::Publishing,
            Self::Interrupted { stage } | Self::Io { stage, .. } => *stage,
        }
    }

    /// Process exit code for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 1,
            Self::Bind(_) => 2,
            Self::ReadinessTimeout { .. } => 3,
            Self::ExternalClient(_) => 4,
            Self::Publish(_) => 5,
            Self::HoldInputClosed => 6,
            Self::Interrupted { .. } => 130,
            Self::Io { stage, .. } => match stage {
                Stage::Publishing => 5,
                _ => 1,
            },
        }
    }

    pub(crate) fn io(stage: Stage) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Io { stage, source }
    }
}

impl From<AcmeError> for IssuanceError {
    fn from(e: AcmeError) -> Self {
        match e {
            AcmeError::IoError(source) => Self::Io {
                stage: Stage::Init,
                source,
            },
            other => Self::Config(other.to_string()),
        }
    }
}
