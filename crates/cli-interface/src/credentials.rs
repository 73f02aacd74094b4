//! Acquisition of the registry token and the container API key
//!
//! Values come from the environment, or from a hidden prompt when the
//! environment has none or an invalid one. They are handed to the core as
//! parameters and never written anywhere.

use console::{style, Term};
use dialoguer::theme::ColorfulTheme;
use dialoguer::Password;
use tracing::warn;

use common::credentials::{validate_api_key, validate_registry_token, Secret};
use common::error::{Error, Result};

/// Environment variable holding the artifact registry token
pub const REGISTRY_TOKEN_ENV: &str = "HF_TOKEN";
/// Environment variable holding the container registry API key
pub const API_KEY_ENV: &str = "NGC_API_KEY";

type Validator = fn(&Secret) -> Result<()>;

pub fn acquire_registry_token() -> Result<Secret> {
    acquire(REGISTRY_TOKEN_ENV, "Hugging Face token", validate_registry_token)
}

pub fn acquire_api_key() -> Result<Secret> {
    acquire(API_KEY_ENV, "NGC API key", validate_api_key)
}

fn acquire(env_var: &str, label: &str, validate: Validator) -> Result<Secret> {
    if let Some(secret) = from_env(env_var, label, validate) {
        println!("{} {} already configured", style("✓").green(), label);
        return Ok(secret);
    }

    if !Term::stderr().is_term() {
        return Err(Error::InvalidArgument(format!(
            "{} is not set or not valid and no terminal is available to ask for the {}",
            env_var, label
        )));
    }

    let value = Password::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Enter your {}", label))
        .validate_with(|input: &String| -> std::result::Result<(), String> {
            validate(&Secret::new(input.trim())).map_err(|e| e.to_string())
        })
        .interact()
        .map_err(|e| Error::Internal(format!("Failed to read {}: {}", label, e)))?;

    println!("{} {} set", style("✓").green(), label);
    Ok(Secret::new(value.trim()))
}

fn from_env(env_var: &str, label: &str, validate: Validator) -> Option<Secret> {
    let value = std::env::var(env_var).ok()?;
    let secret = Secret::new(value.trim());
    if secret.is_empty() {
        return None;
    }
    match validate(&secret) {
        Ok(()) => Some(secret),
        Err(e) => {
            warn!("Ignoring {} from {}: {}", label, env_var, e);
            None
        }
    }
}
