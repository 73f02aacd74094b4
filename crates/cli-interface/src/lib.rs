//! Command-line interface for nim-deploy
//!
//! This crate provides the command tree, credential acquisition, the
//! interactive model menu and the mapping of deployment outcomes to exit
//! codes. It only talks to the core through values passed in and out.

pub mod cli;
pub mod credentials;
pub mod exit;
pub mod menu;
pub mod ui;

// Re-export commonly used types
pub use cli::{Cli, Commands};
pub use credentials::{acquire_api_key, acquire_registry_token};
pub use exit::{exit_code_for_error, exit_code_for_state};
pub use menu::{select_model, MenuEntry};
