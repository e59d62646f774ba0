mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{CertArgs, Cli, Command, ResponderArgs};
use lbc_acme::{
    ArtifactPublisher, Certbot, IssuanceError, IssuanceOrchestrator, StdinConfirmation,
};
use lbc_common::{EnvConfig, LogContext, LogSettings};
use lbc_responder::{AccessLog, ChallengeResponder, ChallengeStore, ResponderError};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::net::SocketAddr;
use std::process::ExitCode;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

const HOLD_PROMPT: &str =
    "Check that the load balancer health check is green, then press Enter to continue... ";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let env = EnvConfig::load(cli.env_file.as_deref());

    let settings = LogSettings {
        dir: Some(cli.log_dir.clone().unwrap_or_else(|| env.log_dir.clone())),
        verbose: cli.verbose,
    };
    let logging = match LogContext::init(&settings) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:#}");
            return ExitCode::from(1);
        }
    };
    if let Some(path) = logging.file_path() {
        info!(log_file = %path.display(), "oci-lb-certbot {}", env!("CARGO_PKG_VERSION"));
    }

    let code = match shutdown_signal() {
        Ok(shutdown) => match cli.command {
            Command::Server { responder } => run_server(responder, shutdown).await,
            Command::Cert(args) => run_cert(&args, &env, shutdown).await,
        },
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(1)
        }
    };

    logging.shutdown();
    code
}

/// First SIGINT/SIGTERM flips the channel to `true`; a second one exits
/// immediately.
fn shutdown_signal() -> anyhow::Result<watch::Receiver<bool>> {
    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("Failed to register signal handlers")?;
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut received = false;
        while let Some(signal) = signals.next().await {
            if received {
                warn!(signal, "Second signal, exiting now");
                std::process::exit(130);
            }
            received = true;
            info!(signal, "Received shutdown signal");
            let _ = tx.send(true);
        }
    });

    Ok(rx)
}

async fn run_server(args: ResponderArgs, shutdown: watch::Receiver<bool>) -> ExitCode {
    match serve(args, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            match e.downcast_ref::<ResponderError>() {
                Some(ResponderError::Bind { .. }) => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}

async fn serve(args: ResponderArgs, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let store = ChallengeStore::new()
        .with_webroot(&args.webroot)
        .with_context(|| format!("Failed to prepare webroot {}", args.webroot.display()))?;
    let challenge_dir = store
        .challenge_dir()
        .map(|d| d.display().to_string())
        .unwrap_or_default();

    let handle = ChallengeResponder::new(store, args.probe_ips.iter().copied().collect())
        .with_access_log(AccessLog::new(args.access_log.clone()))
        .bind(SocketAddr::new(args.bind, args.port))
        .await?;

    info!(
        addr = %handle.local_addr(),
        challenge_dir = %challenge_dir,
        probe_addrs = ?args.probe_ips,
        "Challenge responder running, Ctrl-C to stop"
    );

    // a dropped sender also ends the wait
    let _ = shutdown.wait_for(|stop| *stop).await;

    info!("Stopping challenge responder");
    handle.stop().await?;
    Ok(())
}

async fn run_cert(args: &CertArgs, env: &EnvConfig, shutdown: watch::Receiver<bool>) -> ExitCode {
    let request = match args.to_request(env) {
        Ok(request) => request,
        Err(e) => {
            error!(stage = "init", "Invalid arguments: {e:#}");
            return ExitCode::from(1);
        }
    };

    let orchestrator = IssuanceOrchestrator::new(
        request,
        Certbot::new(args.certbot_bin(env)),
        StdinConfirmation::new(HOLD_PROMPT),
        ArtifactPublisher::new(env.fallback_dir.clone()),
    )
    .with_access_log(AccessLog::new(args.responder.access_log.clone()))
    .with_shutdown(shutdown)
    .with_gitignore_dir(".");

    match orchestrator.run().await {
        Ok(report) => {
            match &report.artifacts {
                Some(set) => info!(
                    certificate = %set.full_chain.display(),
                    private_key = %set.private_key.display(),
                    descriptor = %set.descriptor_path().display(),
                    "Certificate ready for the load balancer"
                ),
                None => info!(
                    output_root = %report.output_root.display(),
                    "Dry run succeeded, nothing published"
                ),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            if let IssuanceError::ExternalClient(output) = &e {
                eprint!("{}", output.combined());
            }
            error!(stage = %e.stage(), "Issuance failed: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}
