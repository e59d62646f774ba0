use axum::{
    Router,
    extract::{ConnectInfo, Request, State},
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::logging::{AccessLog, AccessLogEntry};
use crate::store::{CHALLENGE_PREFIX, ChallengeStore, ProbeAllowlist};

/// Paths that must never be served, even by accident
const DENY_PATTERNS: [&str; 4] = ["/certs", "/letsencrypt", ".pem", "/.git"];

/// Read-only state shared by every connection
pub struct ResponderState {
    pub store: ChallengeStore,
    pub allowlist: ProbeAllowlist,
    pub access_log: AccessLog,
}

/// How a request was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Health check from an allowlisted address
    Probe,
    /// Challenge content served
    Challenge,
    /// Sensitive path refused
    Denied,
    NotFound,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Probe => "probe",
            Self::Challenge => "challenge",
            Self::Denied => "denied",
            Self::NotFound => "not_found",
        }
    }
}

/// Per-request facts used for allowlist matching and logging
#[derive(Debug, Clone)]
pub struct ChallengeRequest {
    pub client: SocketAddr,
    pub method: Method,
    pub path: String,
    pub user_agent: String,
    pub received_at: DateTime<Utc>,
}

impl ChallengeRequest {
    pub fn from_request(client: SocketAddr, req: &Request) -> Self {
        let user_agent = req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        Self {
            client,
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            user_agent,
            received_at: Utc::now(),
        }
    }

    fn is_probe_source(&self, allowlist: &ProbeAllowlist) -> bool {
        allowlist.contains(&self.client.ip())
    }
}

pub fn router(state: Arc<ResponderState>) -> Router {
    Router::new().fallback(challenge_handler).with_state(state)
}

/// Entry point for every request, whatever the path
pub async fn challenge_handler(
    State(state): State<Arc<ResponderState>>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let start = Instant::now();
    let request = ChallengeRequest::from_request(client, &req);

    let (outcome, response) = respond(&state, &request).await;

    let status = response.status().as_u16();
    let duration = start.elapsed();
    info!(
        client = %client.ip(),
        method = %request.method,
        path = %request.path,
        status,
        latency_ms = duration.as_millis() as u64,
        user_agent = %request.user_agent,
        outcome = outcome.as_str(),
        "Request"
    );

    state.access_log.record(AccessLogEntry {
        request,
        outcome,
        status,
        duration,
    });

    response
}

/// Decide the response for a request.
///
/// Probe sources always get `200`: on non-challenge paths they
/// short-circuit before any path matching, and sensitive paths answer them
/// with an empty body. On the challenge path a probe source still gets challenge
/// content when the token is known, since validation traffic forwarded by
/// the load balancer arrives from the same address.
pub async fn respond(state: &ResponderState, request: &ChallengeRequest) -> (Outcome, Response) {
    let is_probe = request.is_probe_source(&state.allowlist);
    let challenge_token = request.path.strip_prefix(CHALLENGE_PREFIX);

    if is_probe && challenge_token.is_none() {
        return (Outcome::Probe, StatusCode::OK.into_response());
    }

    if DENY_PATTERNS.iter().any(|p| request.path.contains(p)) {
        // an empty 200 reveals nothing, so health checks still pass
        if is_probe {
            return (Outcome::Probe, StatusCode::OK.into_response());
        }
        return (Outcome::Denied, StatusCode::NOT_FOUND.into_response());
    }

    if let Some(token) = challenge_token {
        if request.method == Method::GET || request.method == Method::HEAD {
            if let Some(content) = state.store.lookup(token).await {
                let response = (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "text/plain")],
                    content,
                )
                    .into_response();
                return (Outcome::Challenge, response);
            }
        }
    }

    if is_probe {
        return (Outcome::Probe, StatusCode::OK.into_response());
    }

    (Outcome::NotFound, StatusCode::NOT_FOUND.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const PROBE: &str = "203.0.113.5:40000";
    const OTHER: &str = "198.51.100.9:51000";

    fn test_state(webroot: Option<&std::path::Path>) -> Arc<ResponderState> {
        let mut store = match webroot {
            Some(dir) => ChallengeStore::new().with_webroot(dir).unwrap(),
            None => ChallengeStore::new(),
        };
        store.insert("known-token", "known-token.thumbprint");

        Arc::new(ResponderState {
            store,
            allowlist: ProbeAllowlist::new(["203.0.113.5".parse().unwrap()]),
            access_log: AccessLog::disabled(),
        })
    }

    async fn send(
        state: Arc<ResponderState>,
        from: &str,
        method: Method,
        path: &str,
    ) -> (StatusCode, Option<String>, String) {
        let mut req = Request::builder()
            .method(method)
            .uri(path)
            .header(header::USER_AGENT, "test-agent")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(from.parse::<SocketAddr>().unwrap()));

        let resp = router(state).oneshot(req).await.unwrap();
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_probe_any_path_returns_empty_ok() {
        for path in [
            "/",
            "/health",
            "/some/deep/path",
            "/certs/privkey.pem",
            "/.well-known/acme-challenge/x.pem",
            "/.well-known/acme-challenge/.git",
        ] {
            let (status, _, body) = send(test_state(None), PROBE, Method::GET, path).await;
            assert_eq!(status, StatusCode::OK, "path {path}");
            assert!(body.is_empty(), "path {path}");
        }
    }

    #[tokio::test]
    async fn test_probe_any_method_returns_ok() {
        let (status, _, _) = send(test_state(None), PROBE, Method::HEAD, "/").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _, _) = send(test_state(None), PROBE, Method::POST, "/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_known_token_served_as_text() {
        let (status, content_type, body) = send(
            test_state(None),
            OTHER,
            Method::GET,
            "/.well-known/acme-challenge/known-token",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("text/plain"));
        assert_eq!(body, "known-token.thumbprint");
    }

    #[tokio::test]
    async fn test_absent_token_not_found() {
        let (status, _, _) = send(
            test_state(None),
            OTHER,
            Method::GET,
            "/.well-known/acme-challenge/other-token",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_probe_source_still_gets_challenge_content() {
        let (status, _, body) = send(
            test_state(None),
            PROBE,
            Method::GET,
            "/.well-known/acme-challenge/known-token",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "known-token.thumbprint");

        let (status, _, body) = send(
            test_state(None),
            PROBE,
            Method::GET,
            "/.well-known/acme-challenge/unknown",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_non_probe_other_paths_not_found() {
        let (status, _, _) = send(test_state(None), OTHER, Method::GET, "/").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = send(test_state(None), OTHER, Method::GET, "/health").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sensitive_paths_denied() {
        for path in [
            "/certs/example.com/privkey.pem",
            "/letsencrypt/live/example.com/cert.pem",
            "/.git/config",
            "/.well-known/acme-challenge/known-token.pem",
        ] {
            let (status, _, _) = send(test_state(None), OTHER, Method::GET, path).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "path {path}");
        }
    }

    #[tokio::test]
    async fn test_post_to_challenge_not_served() {
        let (status, _, _) = send(
            test_state(None),
            OTHER,
            Method::POST,
            "/.well-known/acme-challenge/known-token",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let (status, _, _) = send(
            test_state(None),
            OTHER,
            Method::GET,
            "/.well-known/acme-challenge/../../etc/passwd",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_webroot_file_served() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(Some(dir.path()));
        std::fs::write(
            state.store.challenge_dir().unwrap().join("from-client"),
            "from-client.abc",
        )
        .unwrap();

        let (status, _, body) = send(
            state,
            OTHER,
            Method::GET,
            "/.well-known/acme-challenge/from-client",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "from-client.abc");
    }

    #[test]
    fn test_challenge_request_extracts_user_agent() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/.well-known/acme-challenge/abc?x=1")
            .header(header::USER_AGENT, "Mozilla/5.0 (compatible; Let's Encrypt validation server)")
            .body(Body::empty())
            .unwrap();
        let request = ChallengeRequest::from_request("192.0.2.1:1234".parse().unwrap(), &req);
        assert_eq!(request.path, "/.well-known/acme-challenge/abc");
        assert!(request.user_agent.contains("Let's Encrypt"));
        assert_eq!(request.method, Method::GET);
    }
}
