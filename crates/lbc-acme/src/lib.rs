//! Certificate issuance behind a load balancer.
//!
//! The orchestrator starts a challenge responder, waits until the load
//! balancer path answers, optionally holds for an operator, runs the
//! external certificate client and publishes the resulting files.

pub mod client;
pub mod credentials;
pub mod error;
pub mod hold;
pub mod orchestrator;
pub mod prober;
pub mod publisher;
pub mod types;

pub use client::{CertClient, Certbot, ChallengeMode, ClientDirs, ClientInvocation, ClientOutput};
pub use error::{AcmeError, AcmeResult, IssuanceError, PublishError, Stage};
pub use hold::{Confirmation, HoldOutcome, StdinConfirmation};
pub use orchestrator::{IssuanceOrchestrator, IssuanceReport, default_probe_url};
pub use prober::{ReadinessProber, WaitResult};
pub use publisher::{ArtifactPublisher, update_gitignore};
pub use types::{
    CertificateArtifactSet, CredentialSource, DnsProvider, DnsSettings, IssuanceRequest,
    LbConfigDescriptor,
};
