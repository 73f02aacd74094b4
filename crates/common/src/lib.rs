//! Common utilities and types for nim-deploy
//!
//! This crate provides the data model shared by every component of the
//! deployment pipeline: model identities, remote repositories, deployment
//! records and states, credentials and the error taxonomy.

pub mod credentials;
pub mod deployment;
pub mod error;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use credentials::{Credentials, Secret};
pub use deployment::{DeploymentRecord, DeploymentState, FailureReason};
pub use error::{Error, Result};
pub use types::*;
