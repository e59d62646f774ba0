//! ACME HTTP-01 challenge responder.
//!
//! Serves `/.well-known/acme-challenge/{token}` from a [`ChallengeStore`] and
//! answers load balancer health checks from addresses in a
//! [`ProbeAllowlist`] with an empty `200 OK`.

pub mod handler;
pub mod logging;
pub mod server;
pub mod store;

pub use handler::{ChallengeRequest, Outcome, ResponderState, challenge_handler, router};
pub use logging::{AccessLog, AccessLogEntry};
pub use server::{ChallengeResponder, ResponderError, ResponderHandle};
pub use store::{CHALLENGE_PREFIX, ChallengeStore, ProbeAllowlist, is_valid_token, parse_probe_addr};
