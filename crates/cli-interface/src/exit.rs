//! Process exit codes

use common::deployment::{DeploymentState, FailureReason};
use common::error::Error;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_RESOLUTION: i32 = 2;
pub const EXIT_CONTAINER_CRASH: i32 = 3;
pub const EXIT_PROBE_TIMEOUT: i32 = 4;
pub const EXIT_CONTAINER_DIED: i32 = 5;
/// 128 + SIGINT
pub const EXIT_STOPPED: i32 = 130;

/// Exit code for the terminal state of a deployment run
pub fn exit_code_for_state(state: &DeploymentState) -> i32 {
    match state {
        DeploymentState::Ready => EXIT_OK,
        DeploymentState::Stopped => EXIT_STOPPED,
        DeploymentState::Failed(reason) => match reason {
            FailureReason::Resolution(_) => EXIT_RESOLUTION,
            FailureReason::ContainerCrash => EXIT_CONTAINER_CRASH,
            FailureReason::ProbeTimeout => EXIT_PROBE_TIMEOUT,
            FailureReason::ContainerDied => EXIT_CONTAINER_DIED,
            FailureReason::Other(_) => EXIT_FAILURE,
        },
        _ => EXIT_FAILURE,
    }
}

/// Exit code for an error raised outside a deployment run
pub fn exit_code_for_error(err: &Error) -> i32 {
    match err {
        Error::Cancelled(_) => EXIT_STOPPED,
        Error::ContainerCrash { .. } => EXIT_CONTAINER_CRASH,
        Error::ProbeTimeout { .. } => EXIT_PROBE_TIMEOUT,
        Error::ContainerDied { .. } => EXIT_CONTAINER_DIED,
        err if err.is_resolution() => EXIT_RESOLUTION,
        _ => EXIT_FAILURE,
    }
}
