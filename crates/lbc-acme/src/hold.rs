//! Operator hold: wait for an explicit confirmation or a timeout,
//! whichever comes first.

use std::future::Future;
use std::io::{self, BufRead, Write};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldOutcome {
    Confirmed,
    TimedOut,
}

/// Source of the operator's go-ahead
pub trait Confirmation {
    /// Resolves when the operator confirms; errors when input is gone
    fn confirmed(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Confirmation by pressing Enter on the terminal.
///
/// The line is read on a detached thread so an abandoned prompt never
/// keeps the runtime from shutting down.
#[derive(Debug, Default)]
pub struct StdinConfirmation {
    prompt: String,
}

impl StdinConfirmation {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

impl Confirmation for StdinConfirmation {
    fn confirmed(&mut self) -> impl Future<Output = io::Result<()>> + Send {
        let (tx, rx) = oneshot::channel();
        let prompt = self.prompt.clone();

        let spawned = std::thread::Builder::new()
            .name("hold-confirmation".into())
            .spawn(move || {
                let mut stderr = io::stderr();
                let _ = write!(stderr, "{prompt}");
                let _ = stderr.flush();

                let mut line = String::new();
                let result = match io::stdin().lock().read_line(&mut line) {
                    Ok(0) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stdin closed")),
                    Ok(_) => Ok(()),
                    Err(e) => Err(e),
                };
                let _ = tx.send(result);
            });

        async move {
            spawned?;
            rx.await
                .unwrap_or_else(|_| Err(io::Error::other("confirmation reader exited")))
        }
    }
}

/// Race the confirmation against the optional timeout.
///
/// If the confirmation source fails (input closed) and a timeout is set,
/// the remaining time is waited out and the hold ends as `TimedOut`;
/// without a timeout the error is returned.
pub async fn hold<C: Confirmation>(
    confirmation: &mut C,
    timeout: Option<Duration>,
) -> io::Result<HoldOutcome> {
    let Some(timeout) = timeout else {
        confirmation.confirmed().await?;
        return Ok(HoldOutcome::Confirmed);
    };

    let deadline = Instant::now() + timeout;
    tokio::select! {
        result = confirmation.confirmed() => match result {
            Ok(()) => Ok(HoldOutcome::Confirmed),
            Err(_) => {
                tokio::time::sleep_until(deadline).await;
                Ok(HoldOutcome::TimedOut)
            }
        },
        _ = tokio::time::sleep_until(deadline) => Ok(HoldOutcome::TimedOut),
    }
}
