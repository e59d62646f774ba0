use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Operator-declared parameters for one issuance run
#[derive(Debug, Clone)]
pub struct IssuanceRequest {
    pub domain: String,
    /// Contact email for the ACME account
    pub email: String,
    /// Backend port the load balancer forwards to
    pub port: u16,
    /// Address the responder binds on
    pub bind_ip: IpAddr,
    pub output_dir: PathBuf,
    pub webroot: PathBuf,
    pub allow_output_in_webroot: bool,
    pub dry_run: bool,
    /// Use the CA's staging environment
    pub staging: bool,
    /// Readiness deadline
    pub wait_timeout: Duration,
    pub probe_interval: Duration,
    /// Overrides the default probe URL built from the domain
    pub probe_url: Option<String>,
    pub probe_addrs: Vec<IpAddr>,
    /// Pause for operator confirmation before running the client
    pub hold: bool,
    pub hold_timeout: Option<Duration>,
    /// DNS-01 instead of HTTP-01 when set
    pub dns: Option<DnsSettings>,
}

impl IssuanceRequest {
    /// A webroot-mode request with the tool's defaults
    pub fn new(domain: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            email: email.into(),
            port: 8000,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            output_dir: PathBuf::from("./certs"),
            webroot: PathBuf::from("."),
            allow_output_in_webroot: false,
            dry_run: false,
            staging: false,
            wait_timeout: Duration::from_secs(120),
            probe_interval: Duration::from_secs(3),
            probe_url: None,
            probe_addrs: Vec::new(),
            hold: false,
            hold_timeout: None,
            dns: None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let domain = self.domain.trim();
        if domain.is_empty() {
            return Err("domain is empty".into());
        }
        if domain
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == '\\')
            || domain.contains("..")
        {
            return Err(format!("invalid domain '{}'", self.domain));
        }
        if !self.email.contains('@') {
            return Err(format!("invalid email '{}'", self.email));
        }
        if self.probe_interval.is_zero() {
            return Err("probe interval must be greater than zero".into());
        }
        if let Some(dns) = &self.dns {
            if let CredentialSource::Token(token) = &dns.credentials {
                if token.trim().is_empty() {
                    return Err("DNS API token is empty".into());
                }
            }
        }
        Ok(())
    }

    pub fn is_dns(&self) -> bool {
        self.dns.is_some()
    }
}

/// DNS-01 parameters
#[derive(Debug, Clone)]
pub struct DnsSettings {
    pub provider: DnsProvider,
    pub credentials: CredentialSource,
    /// Passed to the client as its DNS propagation wait
    pub propagation: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsProvider {
    Cloudflare,
}

impl DnsProvider {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cloudflare => "cloudflare",
        }
    }

    /// File name used when a credential file is created from a token
    pub fn credentials_file_name(&self) -> &'static str {
        match self {
            Self::Cloudflare => "cloudflare.ini",
        }
    }

    pub fn credentials_contents(&self, token: &str) -> String {
        match self {
            Self::Cloudflare => format!("dns_cloudflare_api_token = {}\n", token.trim()),
        }
    }

    /// Plugin flags for the certificate client
    pub fn client_args(&self, credentials: &Path, propagation: Duration) -> Vec<String> {
        let name = self.name();
        vec![
            format!("--dns-{name}"),
            format!("--dns-{name}-credentials"),
            credentials.display().to_string(),
            format!("--dns-{name}-propagation-seconds"),
            propagation.as_secs().to_string(),
        ]
    }
}

impl fmt::Display for DnsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DnsProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cloudflare" => Ok(Self::Cloudflare),
            other => Err(format!("unsupported DNS provider '{other}' (supported: cloudflare)")),
        }
    }
}

/// Where DNS provider credentials come from
#[derive(Clone)]
pub enum CredentialSource {
    /// API token, written to a new owner-only credential file
    Token(String),
    /// Existing credential file
    File(PathBuf),
}

impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(_) => f.write_str("Token(<redacted>)"),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

/// File names of the four artifacts, in copy order
pub const PRIVATE_KEY_FILE: &str = "privkey.pem";
pub const FULL_CHAIN_FILE: &str = "fullchain.pem";
pub const CERT_FILE: &str = "cert.pem";
pub const CHAIN_FILE: &str = "chain.pem";
pub const ARTIFACT_FILES: [&str; 4] = [PRIVATE_KEY_FILE, FULL_CHAIN_FILE, CERT_FILE, CHAIN_FILE];
pub const DESCRIPTOR_FILE: &str = "lb-config.json";

/// The four files issued for a domain, at their published location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateArtifactSet {
    pub domain: String,
    pub dir: PathBuf,
    pub private_key: PathBuf,
    pub full_chain: PathBuf,
    pub certificate: PathBuf,
    pub chain: PathBuf,
}

impl CertificateArtifactSet {
    pub fn in_dir(domain: &str, dir: &Path) -> Self {
        Self {
            domain: domain.to_string(),
            dir: dir.to_path_buf(),
            private_key: dir.join(PRIVATE_KEY_FILE),
            full_chain: dir.join(FULL_CHAIN_FILE),
            certificate: dir.join(CERT_FILE),
            chain: dir.join(CHAIN_FILE),
        }
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.dir.join(DESCRIPTOR_FILE)
    }
}

/// `lb-config.json`: where the load balancer tooling finds issued material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbConfigDescriptor {
    pub domain: String,
    /// Full chain, what load balancers expect as the certificate
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    pub leaf_certificate: PathBuf,
    pub chain: PathBuf,
    pub source_live_dir: PathBuf,
    pub generated_at: DateTime<Utc>,
}

impl LbConfigDescriptor {
    pub fn new(set: &CertificateArtifactSet, source_live_dir: &Path) -> Self {
        Self {
            domain: set.domain.clone(),
            certificate: set.full_chain.clone(),
            private_key: set.private_key.clone(),
            leaf_certificate: set.certificate.clone(),
            chain: set.chain.clone(),
            source_live_dir: source_live_dir.to_path_buf(),
            generated_at: Utc::now(),
        }
    }
}
