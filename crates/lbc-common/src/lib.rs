//! Shared plumbing for oci-lb-certbot: environment configuration and the
//! process logging context.

pub mod config;
pub mod logging;

pub use config::EnvConfig;
pub use logging::{LogContext, LogSettings};
