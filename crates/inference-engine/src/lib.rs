//! Inference container management for nim-deploy
//!
//! This crate runs the inference server image as a container bound to a
//! local artifact set, watches it for early crashes and probes it for
//! readiness.

pub mod docker;
pub mod images;
pub mod orchestrator;
pub mod probe;
pub mod runtime;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use docker::DockerRuntime;
pub use images::ImageCatalog;
pub use orchestrator::ContainerOrchestrator;
pub use probe::{HttpReadinessProbe, ProbeResult, ReadinessProbe};
pub use runtime::{ContainerRuntime, ContainerSpec, ContainerStatus, LogStream, Mount, PortMapping};
