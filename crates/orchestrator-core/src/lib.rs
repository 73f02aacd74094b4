//! Core orchestration logic for nim-deploy
//!
//! This crate provides the deployment state machine that ties the model
//! resolver and the container orchestrator together: it resolves a model
//! into a local artifact set, starts the inference container on it and
//! waits for the server to become ready, honouring cancellation at every
//! step.

pub mod coordinator;
pub mod lifecycle;
pub mod state;

// Re-export commonly used types
pub use coordinator::{CoordinatorSettings, DeploymentCoordinator, DeploymentReport, DeploymentRequest};
pub use lifecycle::{wait_until_ready, LogFollower, ProbeOutcome};
pub use state::StateTracker;
