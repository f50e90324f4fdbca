//! Ferry core: supervision of an external UDP receiver and orchestration of
//! sender runs against it.
//!
//! - `supervisor`: receiver lifecycle with port-conflict retry and staged teardown
//! - `logbuf`: bounded in-memory log of receiver output
//! - `transfer`: request validation, payload staging, adaptive deadlines
//! - `artifacts`: listing, resolving, and pruning received files

pub mod artifacts;
pub mod config;
pub mod error;
pub mod logbuf;
pub mod supervisor;
pub mod transfer;

// Re-export key types for convenience.
pub use artifacts::{Artifact, ArtifactName, ArtifactRegistry};
pub use config::{DeadlinePolicy, SupervisorConfig, TransferConfig};
pub use error::{ArtifactError, StartError, TransferError};
pub use logbuf::{LOG_CAPACITY, LogBuffer, LogEntry};
pub use supervisor::{SessionState, SessionView, Supervisor};
pub use transfer::{TransferCoordinator, TransferParams, TransferReport, TransferRequest};
