//! Issuance state machine.
//!
//! `Init -> ServerStarted -> Waiting -> [Holding] -> ExternalClientRunning
//! -> Publishing`. The DNS-01 variant goes from `Init` straight to
//! `ExternalClientRunning`. The responder is stopped on every path out of
//! the webroot flow, before publication.

use lbc_responder::{
    AccessLog, CHALLENGE_PREFIX, ChallengeResponder, ChallengeStore, ProbeAllowlist,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::client::{CertClient, ChallengeMode, ClientDirs, ClientInvocation, ClientOutput};
use crate::credentials::ensure_credentials;
use crate::error::{IssuanceError, Stage};
use crate::hold::{Confirmation, HoldOutcome, hold};
use crate::prober::{ReadinessProber, WaitResult};
use crate::publisher::{ArtifactPublisher, absolutize, update_gitignore};
use crate::types::{CertificateArtifactSet, DnsSettings, IssuanceRequest};

/// What a successful run did
#[derive(Debug, Clone)]
pub struct IssuanceReport {
    pub output_root: PathBuf,
    /// `None` in DNS-01 mode
    pub responder_addr: Option<SocketAddr>,
    pub readiness: Option<WaitResult>,
    pub hold: Option<HoldOutcome>,
    /// `None` for a dry run that left nothing to publish
    pub artifacts: Option<CertificateArtifactSet>,
    pub client_output: ClientOutput,
}

impl IssuanceReport {
    fn new(output_root: PathBuf) -> Self {
        Self {
            output_root,
            responder_addr: None,
            readiness: None,
            hold: None,
            artifacts: None,
            client_output: ClientOutput::default(),
        }
    }
}

pub struct IssuanceOrchestrator<C, H> {
    request: IssuanceRequest,
    client: C,
    confirmation: H,
    publisher: ArtifactPublisher,
    access_log: AccessLog,
    shutdown: Option<watch::Receiver<bool>>,
    gitignore_dir: Option<PathBuf>,
}

impl<C: CertClient, H: Confirmation> IssuanceOrchestrator<C, H> {
    pub fn new(request: IssuanceRequest, client: C, confirmation: H, publisher: ArtifactPublisher) -> Self {
        Self {
            request,
            client,
            confirmation,
            publisher,
            access_log: AccessLog::disabled(),
            shutdown: None,
            gitignore_dir: None,
        }
    }

    pub fn with_access_log(mut self, access_log: AccessLog) -> Self {
        self.access_log = access_log;
        self
    }

    /// Abort the waiting and holding phases once `true` is sent
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Add ignore entries for issued material to `<dir>/.gitignore` after success
    pub fn with_gitignore_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.gitignore_dir = Some(dir.into());
        self
    }

    pub async fn run(mut self) -> Result<IssuanceReport, IssuanceError> {
        self.request.validate().map_err(IssuanceError::Config)?;
        let domain = self.request.domain.clone();

        let webroot = absolutize(&self.request.webroot).map_err(IssuanceError::io(Stage::Init))?;
        let guard_webroot = (!self.request.is_dns() && !self.request.allow_output_in_webroot)
            .then_some(webroot.as_path());
        let out_root = self
            .publisher
            .prepare_output_root(&self.request.output_dir, guard_webroot)
            .map_err(IssuanceError::io(Stage::Init))?;

        let dirs = ClientDirs::under(&out_root);
        dirs.create_all().map_err(IssuanceError::io(Stage::Init))?;

        info!(
            stage = %Stage::Init,
            domain = %domain,
            output_root = %out_root.display(),
            dry_run = self.request.dry_run,
            mode = if self.request.is_dns() { "dns-01" } else { "http-01" },
            "Starting issuance"
        );

        let mut report = IssuanceReport::new(out_root.clone());
        match self.request.dns.clone() {
            Some(dns) => self.run_dns(&dns, &dirs, &mut report).await?,
            None => self.run_webroot(&webroot, &dirs, &mut report).await?,
        }

        info!(stage = %Stage::Publishing, domain = %domain, "Publishing artifacts");
        report.artifacts = self
            .publisher
            .publish(&domain, &dirs.live_dir(&domain), &out_root, self.request.dry_run)
            .map_err(IssuanceError::Publish)?;

        if let Some(dir) = &self.gitignore_dir {
            if let Err(e) = update_gitignore(dir, &out_root) {
                warn!(dir = %dir.display(), error = %e, "Could not update .gitignore");
            }
        }

        info!(domain = %domain, "Issuance complete");
        Ok(report)
    }

    async fn run_webroot(
        &mut self,
        webroot: &Path,
        dirs: &ClientDirs,
        report: &mut IssuanceReport,
    ) -> Result<(), IssuanceError> {
        let token = hex::encode(rand::random::<[u8; 16]>());
        let content = hex::encode(rand::random::<[u8; 16]>());

        let mut store = ChallengeStore::new()
            .with_webroot(webroot)
            .map_err(IssuanceError::io(Stage::Init))?;
        store.insert(&token, &content);
        let allowlist: ProbeAllowlist = self.request.probe_addrs.iter().copied().collect();

        let addr = SocketAddr::new(self.request.bind_ip, self.request.port);
        let handle = ChallengeResponder::new(store, allowlist)
            .with_access_log(self.access_log.clone())
            .bind(addr)
            .await
            .map_err(IssuanceError::Bind)?;
        report.responder_addr = Some(handle.local_addr());
        info!(
            stage = %Stage::ServerStarted,
            addr = %handle.local_addr(),
            probe_addrs = self.request.probe_addrs.len(),
            "Responder up, challenge store populated"
        );

        let result = self.serve_until_issued(&token, &content, webroot, dirs, report).await;

        if let Err(e) = handle.stop().await {
            warn!(error = %e, "Challenge responder did not stop cleanly");
        }
        if let Err(e) = &result {
            error!(stage = %e.stage(), error = %e, "Issuance aborted, responder stopped");
        }
        result
    }

    async fn serve_until_issued(
        &mut self,
        token: &str,
        content: &str,
        webroot: &Path,
        dirs: &ClientDirs,
        report: &mut IssuanceReport,
    ) -> Result<(), IssuanceError> {
        let (url, expected) = match &self.request.probe_url {
            Some(url) => (url.clone(), None),
            None => (default_probe_url(&self.request.domain, token), Some(content)),
        };
        let mut prober =
            ReadinessProber::new(&url, self.request.probe_interval, self.request.wait_timeout);
        if let Some(body) = expected {
            prober = prober.expect_body(body);
        }

        info!(stage = %Stage::Waiting, url = %url, "Probing load balancer path");
        let waited = tokio::select! {
            result = prober.wait() => result,
            _ = interrupted(&mut self.shutdown) => {
                return Err(IssuanceError::Interrupted { stage: Stage::Waiting });
            }
        };
        report.readiness = Some(waited);

        if let WaitResult::TimedOut(elapsed) = waited {
            if !self.request.hold {
                return Err(IssuanceError::ReadinessTimeout { url, elapsed });
            }
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                "Load balancer path not ready; only an explicit confirmation will continue"
            );
        }

        if self.request.hold {
            info!(
                stage = %Stage::Holding,
                timeout_s = self.request.hold_timeout.map(|t| t.as_secs()),
                "Holding for operator confirmation"
            );
            let outcome = tokio::select! {
                result = hold(&mut self.confirmation, self.request.hold_timeout) => result,
                _ = interrupted(&mut self.shutdown) => {
                    return Err(IssuanceError::Interrupted { stage: Stage::Holding });
                }
            };
            match &outcome {
                Ok(HoldOutcome::Confirmed) => info!("Operator confirmed, continuing"),
                Ok(HoldOutcome::TimedOut) if waited.is_ready() => {
                    info!("Hold timeout elapsed, continuing")
                }
                Ok(HoldOutcome::TimedOut) => {
                    return Err(IssuanceError::ReadinessTimeout {
                        url,
                        elapsed: waited.elapsed(),
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Confirmation input unavailable");
                    return Err(IssuanceError::HoldInputClosed);
                }
            }
            report.hold = outcome.ok();
        }

        let mode = ChallengeMode::Webroot {
            webroot: webroot.to_path_buf(),
        };
        report.client_output = self.invoke(mode, dirs).await?;
        Ok(())
    }

    async fn run_dns(
        &mut self,
        dns: &DnsSettings,
        dirs: &ClientDirs,
        report: &mut IssuanceReport,
    ) -> Result<(), IssuanceError> {
        let credentials = ensure_credentials(dns.provider, &dns.credentials, &report.output_root)?;
        let mode = ChallengeMode::Dns {
            provider: dns.provider,
            credentials,
            propagation: dns.propagation,
        };
        report.client_output = self.invoke(mode, dirs).await.inspect_err(|e| {
            error!(stage = %e.stage(), error = %e, "Issuance aborted");
        })?;
        Ok(())
    }

    async fn invoke(&self, mode: ChallengeMode, dirs: &ClientDirs) -> Result<ClientOutput, IssuanceError> {
        let invocation = ClientInvocation {
            domain: self.request.domain.clone(),
            email: self.request.email.clone(),
            dry_run: self.request.dry_run,
            staging: self.request.staging,
            mode,
            dirs: dirs.clone(),
        };

        info!(
            stage = %Stage::ExternalClientRunning,
            domain = %invocation.domain,
            dry_run = invocation.dry_run,
            "Invoking certificate client"
        );
        let output = self.client.obtain(&invocation).await;
        if !output.success {
            return Err(IssuanceError::ExternalClient(output));
        }
        info!(status = %output.status_text(), "Certificate client succeeded");
        Ok(output)
    }
}

/// Challenge path for the readiness token, as seen through the load balancer
pub fn default_probe_url(domain: &str, token: &str) -> String {
    format!("http://{domain}{CHALLENGE_PREFIX}{token}")
}

/// Resolves once shutdown is signalled; never without a receiver
async fn interrupted(shutdown: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown {
        let closed = rx.wait_for(|stop| *stop).await.is_err();
        if !closed {
            return;
        }
    }
    std::future::pending::<()>().await
}
