use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use lbc_acme::{CredentialSource, DnsProvider, DnsSettings, IssuanceRequest};
use lbc_common::EnvConfig;
use lbc_responder::parse_probe_addr;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "oci-lb-certbot")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Issue ACME certificates for a service behind a load balancer", long_about = None)]
pub struct Cli {
    /// Debug output on the console
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory for the rotating log file [default: LBC_LOG_DIR or ./logs]
    #[arg(long, global = true, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Read defaults from this file instead of ./.env
    #[arg(long, global = true, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve challenges and health checks until interrupted
    Server {
        #[command(flatten)]
        responder: ResponderArgs,
    },

    /// Obtain a certificate and publish it for the load balancer
    Cert(Box<CertArgs>),
}

#[derive(Args, Debug, Clone)]
pub struct ResponderArgs {
    /// Backend port the load balancer forwards to
    #[arg(short, long, default_value_t = 8000)]
    pub port: u16,

    /// Address to bind the responder on
    #[arg(long, default_value = "0.0.0.0", value_name = "IP")]
    pub bind: IpAddr,

    /// Load balancer health check source address (repeatable, no CIDR)
    #[arg(long = "probe-ip", value_name = "IP", value_parser = parse_probe_addr)]
    pub probe_ips: Vec<IpAddr>,

    /// Directory whose .well-known/acme-challenge is served
    #[arg(long, default_value = ".", value_name = "DIR")]
    pub webroot: PathBuf,

    /// Append one JSON line per request to this file
    #[arg(long, value_name = "FILE")]
    pub access_log: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct CertArgs {
    #[command(flatten)]
    pub responder: ResponderArgs,

    #[arg(short, long)]
    pub domain: String,

    /// ACME account contact
    #[arg(short = 'm', long)]
    pub email: String,

    #[arg(short, long, default_value = "./certs", value_name = "DIR")]
    pub output_dir: PathBuf,

    /// Validate against the CA without issuing
    #[arg(long)]
    pub dry_run: bool,

    /// Use the CA's staging environment
    #[arg(long)]
    pub staging: bool,

    /// Seconds to wait for the load balancer path
    #[arg(long, default_value_t = 120, value_name = "SECS")]
    pub wait_timeout: u64,

    /// Seconds between probes [default: LBC_PROBE_INTERVAL_SECS or 3]
    #[arg(long, value_name = "SECS")]
    pub probe_interval: Option<u64>,

    /// Probe this URL instead of the readiness token on the domain
    #[arg(long, value_name = "URL")]
    pub probe_url: Option<String>,

    /// Wait for Enter before running the certificate client
    #[arg(long)]
    pub hold: bool,

    /// Give up holding after this many seconds
    #[arg(long, value_name = "SECS", requires = "hold")]
    pub hold_timeout: Option<u64>,

    /// Use DNS-01 through this provider (cloudflare)
    #[arg(long, value_name = "PROVIDER")]
    pub dns_provider: Option<DnsProvider>,

    /// Provider API token, written to an owner-only credential file [default: CF_API_TOKEN]
    #[arg(long, value_name = "TOKEN", requires = "dns_provider", conflicts_with = "dns_credentials")]
    pub dns_token: Option<String>,

    /// Existing provider credential file
    #[arg(long, value_name = "FILE", requires = "dns_provider")]
    pub dns_credentials: Option<PathBuf>,

    #[arg(long, default_value_t = 30, value_name = "SECS")]
    pub dns_propagation_seconds: u64,

    /// Keep the output directory even when it lies in the served challenge tree
    #[arg(long)]
    pub allow_output_in_webroot: bool,

    /// certbot executable [default: LBC_CERTBOT_BIN or certbot]
    #[arg(long, value_name = "PATH")]
    pub certbot_bin: Option<String>,
}

impl CertArgs {
    pub fn to_request(&self, env: &EnvConfig) -> Result<IssuanceRequest> {
        let mut req = IssuanceRequest::new(self.domain.trim(), self.email.trim());
        req.port = self.responder.port;
        req.bind_ip = self.responder.bind;
        req.probe_addrs = self.responder.probe_ips.clone();
        req.webroot = self.responder.webroot.clone();
        req.output_dir = self.output_dir.clone();
        req.allow_output_in_webroot = self.allow_output_in_webroot;
        req.dry_run = self.dry_run;
        req.staging = self.staging;
        req.wait_timeout = Duration::from_secs(self.wait_timeout);
        req.probe_interval =
            Duration::from_secs(self.probe_interval.unwrap_or(env.probe_interval_secs));
        req.probe_url = self.probe_url.clone();
        req.hold = self.hold;
        req.hold_timeout = self.hold_timeout.map(Duration::from_secs);

        if let Some(provider) = self.dns_provider {
            let credentials = match (&self.dns_token, &self.dns_credentials) {
                (Some(token), _) => CredentialSource::Token(token.clone()),
                (None, Some(path)) => CredentialSource::File(path.clone()),
                (None, None) => match (provider, &env.cf_api_token) {
                    (DnsProvider::Cloudflare, Some(token)) => CredentialSource::Token(token.clone()),
                    _ => bail!(
                        "--dns-provider {provider} needs --dns-token, --dns-credentials or CF_API_TOKEN"
                    ),
                },
            };
            req.dns = Some(DnsSettings {
                provider,
                credentials,
                propagation: Duration::from_secs(self.dns_propagation_seconds),
            });
        }

        if let Err(reason) = req.validate() {
            bail!("{reason}");
        }
        Ok(req)
    }

    pub fn certbot_bin(&self, env: &EnvConfig) -> String {
        self.certbot_bin
            .clone()
            .unwrap_or_else(|| env.certbot_bin.clone())
    }
}
