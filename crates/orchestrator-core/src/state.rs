//! State tracking for a deployment run
//!
//! The tracker is the single writer of a run's [`DeploymentState`]. Every
//! transition is checked against the allowed edges of the state machine
//! and recorded in the run's history.

use parking_lot::Mutex;
use tracing::{debug, info};

use common::deployment::DeploymentState;
use common::error::{Error, Result};

/// Current state of one deployment run plus the path it took
pub struct StateTracker {
    label: String,
    history: Mutex<Vec<DeploymentState>>,
}

impl StateTracker {
    /// Starts in [`DeploymentState::Init`]; `label` names the deployment in logs
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            history: Mutex::new(vec![DeploymentState::Init]),
        }
    }

    pub fn current(&self) -> DeploymentState {
        self.history
            .lock()
            .last()
            .cloned()
            .unwrap_or(DeploymentState::Init)
    }

    /// States visited so far, starting with `Init`
    pub fn history(&self) -> Vec<DeploymentState> {
        self.history.lock().clone()
    }

    /// Moves to `next` if the state machine allows it
    pub fn transition(&self, next: DeploymentState) -> Result<()> {
        let mut history = self.history.lock();
        let current = history.last().cloned().unwrap_or(DeploymentState::Init);
        if !current.can_transition_to(&next) {
            return Err(Error::Internal(format!(
                "Invalid state transition for {}: {} -> {}",
                self.label, current, next
            )));
        }

        match &next {
            DeploymentState::Failed(_) | DeploymentState::Ready | DeploymentState::Stopped => {
                info!("{}: {} -> {}", self.label, current, next)
            }
            _ => debug!("{}: {} -> {}", self.label, current, next),
        }

        history.push(next);
        Ok(())
    }
}
