//! ecrflow BuildKit build functionality
//!
//! This crate drives a single build-and-push on a BuildKit engine over
//! its gRPC API: frontend selection, the session that answers the
//! daemon's registry auth and file sync callbacks, the concurrent
//! solve/progress orchestration, and decoding of the pushed image
//! descriptor.

pub mod auth;
pub mod builder;
pub mod client;
pub mod descriptor;
pub mod dial;
pub mod error;
pub mod lease;
pub mod options;
pub mod progress;
pub mod proto;
pub mod resolver;
pub mod session;
pub mod solve;

#[cfg(test)]
mod testing;

pub use auth::{AuthService, AuthSession, CredentialsRequest, CredentialsResponse};
pub use builder::BuildOrchestrator;
pub use client::{BuildkitEngine, DEFAULT_BUILDKIT_ADDR};
pub use descriptor::ImageDescriptor;
pub use dial::BuilderAddress;
pub use error::{AuthError, BuildError, BuildResult};
pub use lease::{BuilderLease, DEFAULT_CONNECT_TIMEOUT, DirectBuilder};
pub use options::{Architecture, BuildSpec, DEFAULT_RAILPACK_VERSION, Frontend};
pub use progress::{ConsoleProgress, ProgressSink, SolveStatus};
pub use resolver::{prepare_railpack_plan, select_frontend};
pub use session::Session;
pub use solve::{Attachable, BuildEngine, ExportEntry, SolveRequest, SolveResponse};
