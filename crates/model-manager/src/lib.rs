//! Model artifact acquisition for nim-deploy
//!
//! This crate fetches model configuration and quantized weight files from
//! a remote registry and assembles them into the canonical on-disk layout
//! that the inference container is started against.

pub mod downloader;
pub mod layout;
pub mod metadata;
pub mod quantization;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod source;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use layout::{Discovery, LayoutManager, LocalArtifactSet, LocalState, ResumableSet};
pub use metadata::Provenance;
pub use registry::HfArtifactSource;
pub use resolver::{ModelResolver, ResolvePlan};
pub use retry::RetryPolicy;
pub use source::ArtifactSource;
