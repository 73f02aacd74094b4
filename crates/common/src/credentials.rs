//! Credentials handed to the pipeline by the caller.
//!
//! Tokens are only ever held in memory. `Secret` keeps them out of `Debug`
//! and `Display` output so they cannot leak into logs.

use std::fmt;

use crate::error::{Error, Result};

const REGISTRY_TOKEN_PREFIX: &str = "hf_";
const API_KEY_PREFIX: &str = "nvapi-";

/// A credential value that never prints itself
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw value; callers must not log it
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// The two credentials a deployment needs
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Token for the artifact registry
    pub registry_token: Secret,
    /// API key the inference container uses to reach its own registry
    pub api_key: Secret,
}

impl Credentials {
    pub fn new(registry_token: Secret, api_key: Secret) -> Self {
        Self {
            registry_token,
            api_key,
        }
    }

    /// Checks the shape of both credentials
    pub fn validate(&self) -> Result<()> {
        validate_registry_token(&self.registry_token)?;
        validate_api_key(&self.api_key)
    }
}

/// Registry tokens start with `hf_`
pub fn validate_registry_token(token: &Secret) -> Result<()> {
    if token.expose().starts_with(REGISTRY_TOKEN_PREFIX) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "Registry token is not valid: it must start with '{}'",
            REGISTRY_TOKEN_PREFIX
        )))
    }
}

/// Container API keys start with `nvapi-`
pub fn validate_api_key(key: &Secret) -> Result<()> {
    if key.expose().starts_with(API_KEY_PREFIX) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "API key is not valid: it must start with '{}'",
            API_KEY_PREFIX
        )))
    }
}
