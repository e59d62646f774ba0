//! Boundary to the external certificate client (certbot).
//!
//! The client is an opaque subprocess with two outcomes. Its protocol
//! errors are not interpreted here; the captured output is handed back to
//! the operator as-is.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info};

use crate::types::DnsProvider;

/// Isolated client directories under the output root, so no system paths
/// are touched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDirs {
    pub config_dir: PathBuf,
    pub work_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl ClientDirs {
    pub fn under(out_root: &Path) -> Self {
        Self {
            config_dir: out_root.join("letsencrypt"),
            work_dir: out_root.join("letsencrypt-work"),
            logs_dir: out_root.join("letsencrypt-logs"),
        }
    }

    pub fn create_all(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.work_dir)?;
        std::fs::create_dir_all(&self.logs_dir)?;
        Ok(())
    }

    /// Where the client leaves the current artifacts for a domain
    pub fn live_dir(&self, domain: &str) -> PathBuf {
        self.config_dir.join("live").join(domain)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeMode {
    /// Client writes challenge files under the webroot served by the responder
    Webroot { webroot: PathBuf },
    /// Client publishes TXT records through a DNS plugin
    Dns {
        provider: DnsProvider,
        credentials: PathBuf,
        propagation: Duration,
    },
}

/// Everything the client is told for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInvocation {
    pub domain: String,
    pub email: String,
    pub dry_run: bool,
    pub staging: bool,
    pub mode: ChallengeMode,
    pub dirs: ClientDirs,
}

impl ClientInvocation {
    /// certbot command line, without the executable
    pub fn certbot_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "certonly".into(),
            "--non-interactive".into(),
            "--agree-tos".into(),
            "--email".into(),
            self.email.clone(),
            "--domain".into(),
            self.domain.clone(),
        ];

        match &self.mode {
            ChallengeMode::Webroot { webroot } => {
                args.push("--webroot".into());
                args.push("--webroot-path".into());
                args.push(webroot.display().to_string());
            }
            ChallengeMode::Dns {
                provider,
                credentials,
                propagation,
            } => args.extend(provider.client_args(credentials, *propagation)),
        }

        if self.dry_run {
            args.push("--dry-run".into());
        } else if self.staging {
            args.push("--test-cert".into());
        }

        args.extend([
            "--config-dir".into(),
            self.dirs.config_dir.display().to_string(),
            "--work-dir".into(),
            self.dirs.work_dir.display().to_string(),
            "--logs-dir".into(),
            self.dirs.logs_dir.display().to_string(),
        ]);
        args
    }
}

/// What the client reported
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientOutput {
    pub success: bool,
    /// Exit code; `None` when killed by a signal or never started
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ClientOutput {
    pub fn failed_to_start(program: &str, reason: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            status: None,
            stdout: String::new(),
            stderr: format!("failed to start {program}: {reason}"),
        }
    }

    pub fn status_text(&self) -> String {
        match self.status {
            Some(code) => code.to_string(),
            None => "none".to_string(),
        }
    }

    /// stdout followed by stderr, verbatim
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !out.is_empty() && !out.ends_with('\n') && !self.stderr.is_empty() {
            out.push('\n');
        }
        out.push_str(&self.stderr);
        out
    }
}

/// The external certificate client
pub trait CertClient {
    fn obtain(&self, invocation: &ClientInvocation) -> impl Future<Output = ClientOutput> + Send;
}

/// certbot run as a subprocess
#[derive(Debug, Clone)]
pub struct Certbot {
    program: String,
}

impl Certbot {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for Certbot {
    fn default() -> Self {
        Self::new("certbot")
    }
}

impl CertClient for Certbot {
    fn obtain(&self, invocation: &ClientInvocation) -> impl Future<Output = ClientOutput> + Send {
        let program = self.program.clone();
        let args = invocation.certbot_args();
        let domain = invocation.domain.clone();

        async move {
            info!(program = %program, domain = %domain, "Running certificate client");
            debug!(args = ?args, "Certificate client arguments");

            let output = tokio::process::Command::new(&program)
                .args(&args)
                .stdin(Stdio::null())
                .output()
                .await;

            match output {
                Ok(output) => ClientOutput {
                    success: output.status.success(),
                    status: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                },
                Err(e) => ClientOutput::failed_to_start(&program, e),
            }
        }
    }
}
