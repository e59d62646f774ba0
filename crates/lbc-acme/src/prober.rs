use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Upper bound for a single probe request
const MAX_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of the readiness phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Ready(Duration),
    TimedOut(Duration),
}

impl WaitResult {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Ready(d) | Self::TimedOut(d) => *d,
        }
    }
}

/// Polls a URL reachable through the load balancer until it answers.
///
/// Dropping the future returned by [`ReadinessProber::wait`] stops probing
/// immediately.
#[derive(Debug, Clone)]
pub struct ReadinessProber {
    client: reqwest::Client,
    url: String,
    expected_body: Option<String>,
    interval: Duration,
    deadline: Duration,
}

impl ReadinessProber {
    pub fn new(url: impl Into<String>, interval: Duration, deadline: Duration) -> Self {
        // an attempt never outlives its tick
        let timeout = interval.min(MAX_ATTEMPT_TIMEOUT);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url: url.into(),
            expected_body: None,
            interval,
            deadline,
        }
    }

    /// Only count a response as ready when its body equals `body`
    pub fn expect_body(mut self, body: impl Into<String>) -> Self {
        self.expected_body = Some(body.into());
        self
    }

    /// Probe at a fixed interval until a success or the deadline.
    ///
    /// `TimedOut` is only returned once the deadline has passed.
    pub async fn wait(&self) -> WaitResult {
        let start = Instant::now();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            url = %self.url,
            interval_ms = self.interval.as_millis() as u64,
            deadline_s = self.deadline.as_secs(),
            "Waiting for load balancer path to become ready"
        );

        let mut attempt: u32 = 0;
        loop {
            ticker.tick().await;
            attempt += 1;

            match self.attempt().await {
                Ok(status) => {
                    let elapsed = start.elapsed();
                    debug!(attempt, status, elapsed_ms = elapsed.as_millis() as u64, "Probe succeeded");
                    info!(attempt, elapsed_ms = elapsed.as_millis() as u64, "Load balancer path ready");
                    return WaitResult::Ready(elapsed);
                }
                Err(reason) => {
                    debug!(attempt, url = %self.url, reason = %reason, "Probe failed");
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= self.deadline {
                warn!(
                    attempts = attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Load balancer path not ready before deadline"
                );
                return WaitResult::TimedOut(elapsed);
            }
        }
    }

    async fn attempt(&self) -> Result<u16, String> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| format!("request error: {e}"))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }

        if let Some(expected) = &self.expected_body {
            let body = resp
                .text()
                .await
                .map_err(|e| format!("body read error: {e}"))?;
            if body.trim() != expected.trim() {
                return Err(format!("HTTP {status} with unexpected body ({} bytes)", body.len()));
            }
        }

        Ok(status.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, extract::State, http::StatusCode, routing::get};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves 503 until `ready_after` requests have been seen, then 200
    async fn flaky_server(ready_after: usize, body: &'static str) -> (SocketAddr, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/ready",
                get(move |State((hits, ready_after)): State<(Arc<AtomicUsize>, usize)>| async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                    if n >= ready_after {
                        (StatusCode::OK, body)
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, "")
                    }
                }),
            )
            .with_state((hits.clone(), ready_after));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, hits)
    }

    #[tokio::test]
    async fn test_ready_after_k_attempts() {
        let (addr, hits) = flaky_server(3, "ok").await;
        let interval = Duration::from_millis(100);
        let deadline = Duration::from_secs(5);

        let prober = ReadinessProber::new(format!("http://{addr}/ready"), interval, deadline);
        let result = prober.wait().await;

        assert!(result.is_ready());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        // first attempt is immediate, so k attempts span k-1 intervals
        assert!(result.elapsed() >= Duration::from_millis(190));
        assert!(result.elapsed() < deadline + interval);
    }

    #[tokio::test]
    async fn test_never_ready_times_out_after_deadline() {
        let (addr, hits) = flaky_server(usize::MAX, "ok").await;
        let deadline = Duration::from_millis(300);

        let prober = ReadinessProber::new(
            format!("http://{addr}/ready"),
            Duration::from_millis(50),
            deadline,
        );
        let result = prober.wait().await;

        assert!(!result.is_ready());
        assert!(result.elapsed() >= deadline);
        assert!(hits.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_connection_refused_times_out() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let deadline = Duration::from_millis(200);
        let prober =
            ReadinessProber::new(format!("http://{addr}/"), Duration::from_millis(50), deadline);
        match prober.wait().await {
            WaitResult::TimedOut(elapsed) => assert!(elapsed >= deadline),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hanging_endpoint_bounded_by_interval() {
        let app = Router::new().route(
            "/ready",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let interval = Duration::from_millis(100);
        let deadline = Duration::from_millis(300);
        let prober = ReadinessProber::new(format!("http://{addr}/ready"), interval, deadline);

        match prober.wait().await {
            WaitResult::TimedOut(elapsed) => {
                assert!(elapsed >= deadline);
                // each attempt gives up after one interval, not a whole second
                assert!(elapsed < Duration::from_millis(800), "took {elapsed:?}");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expected_body_must_match() {
        let (addr, _) = flaky_server(1, "readiness-content").await;
        let url = format!("http://{addr}/ready");

        let wrong = ReadinessProber::new(&url, Duration::from_millis(50), Duration::from_millis(150))
            .expect_body("something-else");
        assert!(!wrong.wait().await.is_ready());

        let right = ReadinessProber::new(&url, Duration::from_millis(50), Duration::from_secs(2))
            .expect_body("readiness-content");
        assert!(right.wait().await.is_ready());
    }

    #[tokio::test]
    async fn test_dropping_wait_stops_probing() {
        let (addr, hits) = flaky_server(usize::MAX, "ok").await;
        let prober = ReadinessProber::new(
            format!("http://{addr}/ready"),
            Duration::from_millis(50),
            Duration::from_secs(30),
        );

        let outcome = tokio::time::timeout(Duration::from_millis(180), prober.wait()).await;
        assert!(outcome.is_err());

        let seen = hits.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), seen);
    }
}
