//! Deployment records and their lifecycle states.

use std::fmt;
use std::path::PathBuf;
use serde::{Deserialize, Serialize};

use crate::types::ModelIdentity;

/// Why a deployment ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The model could not be resolved into a complete local artifact set
    Resolution(String),
    /// The container exited during its startup grace period
    ContainerCrash,
    /// The container stopped while the readiness probe was waiting
    ContainerDied,
    /// The server never reported ready within the probe timeout
    ProbeTimeout,
    /// Anything else, e.g. a container runtime command failing
    Other(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Resolution(msg) => write!(f, "ResolutionError: {}", msg),
            FailureReason::ContainerCrash => write!(f, "ContainerCrashError"),
            FailureReason::ContainerDied => write!(f, "ContainerDied"),
            FailureReason::ProbeTimeout => write!(f, "ProbeTimeout"),
            FailureReason::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Represents the current state of a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentState {
    /// Nothing has happened yet
    Init,

    /// Inspecting local and remote state for the selected model
    Resolving,

    /// Downloading missing artifacts into the local layout
    Assembling,

    /// Launching the inference container
    Starting,

    /// Waiting for the inference server to report ready
    Probing,

    /// The server accepts requests (terminal success)
    Ready,

    /// The deployment failed (terminal)
    Failed(FailureReason),

    /// The user cancelled the deployment (terminal)
    Stopped,
}

impl DeploymentState {
    /// Returns true for `Ready`, `Failed` and `Stopped`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentState::Ready | DeploymentState::Failed(_) | DeploymentState::Stopped
        )
    }

    /// Returns true once a container may have been started for this run
    pub fn has_container(&self) -> bool {
        matches!(
            self,
            DeploymentState::Starting | DeploymentState::Probing | DeploymentState::Ready
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// States advance strictly forward. `Failed` is reachable from every
    /// non-terminal state, `Stopped` from every non-terminal state and from
    /// `Ready`.
    pub fn can_transition_to(&self, next: &DeploymentState) -> bool {
        use DeploymentState::*;

        match (self, next) {
            (Init, Resolving) => true,
            (Resolving, Assembling) | (Resolving, Starting) => true,
            (Assembling, Starting) => true,
            (Starting, Probing) => true,
            (Probing, Ready) => true,
            (Ready, Stopped) => true,
            (current, Failed(_)) | (current, Stopped) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentState::Init => write!(f, "Init"),
            DeploymentState::Resolving => write!(f, "Resolving"),
            DeploymentState::Assembling => write!(f, "Assembling"),
            DeploymentState::Starting => write!(f, "Starting"),
            DeploymentState::Probing => write!(f, "Probing"),
            DeploymentState::Ready => write!(f, "Ready"),
            DeploymentState::Failed(reason) => write!(f, "Failed({})", reason),
            DeploymentState::Stopped => write!(f, "Stopped"),
        }
    }
}

impl Default for DeploymentState {
    fn default() -> Self {
        DeploymentState::Init
    }
}

/// One deployment of a model as an inference container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub identity: ModelIdentity,
    /// Absolute path of the local artifact set
    pub host_directory: PathBuf,
    pub container_name: String,
    /// Cache shared by all deployments
    pub cache_directory: PathBuf,
    pub state: DeploymentState,
    /// Host port the inference server is published on
    pub port: u16,
}

impl DeploymentRecord {
    pub fn new(
        identity: ModelIdentity,
        host_directory: PathBuf,
        container_name: impl Into<String>,
        cache_directory: PathBuf,
        port: u16,
    ) -> Self {
        Self {
            identity,
            host_directory,
            container_name: container_name.into(),
            cache_directory,
            state: DeploymentState::Init,
            port,
        }
    }

    /// Served model name passed to the inference server
    pub fn served_model_name(&self) -> String {
        self.identity.display_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeploymentState::*;

    #[test]
    fn test_forward_path_is_allowed() {
        let path = [Init, Resolving, Assembling, Starting, Probing, Ready];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(&pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(Resolving.can_transition_to(&Starting));
    }

    #[test]
    fn test_backward_and_skipping_transitions_are_rejected() {
        assert!(!Probing.can_transition_to(&Starting));
        assert!(!Init.can_transition_to(&Probing));
        assert!(!Starting.can_transition_to(&Ready));
        assert!(!Ready.can_transition_to(&Probing));
    }

    #[test]
    fn test_terminal_states() {
        let failed = Failed(FailureReason::ProbeTimeout);
        assert!(failed.is_terminal());
        assert!(Stopped.is_terminal());
        assert!(Ready.is_terminal());

        assert!(!failed.can_transition_to(&Stopped));
        assert!(!Stopped.can_transition_to(&Failed(FailureReason::ContainerDied)));
        assert!(Ready.can_transition_to(&Stopped));
        assert!(!Ready.can_transition_to(&Failed(FailureReason::ContainerDied)));

        for state in [Init, Resolving, Assembling, Starting, Probing] {
            assert!(state.can_transition_to(&Stopped));
            assert!(state.can_transition_to(&Failed(FailureReason::Other("x".into()))));
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(Probing.to_string(), "Probing");
        assert_eq!(
            Failed(FailureReason::Resolution("no such repo".into())).to_string(),
            "Failed(ResolutionError: no such repo)"
        );
        assert_eq!(DeploymentState::default(), Init);
    }
}
