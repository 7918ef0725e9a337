use crate::gateway::Ec2Error;
use crate::instance::{InstanceId, InstanceState};
use crate::regions::Region;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the fleet registry.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("unknown instance state '{0}'")]
    UnknownState(String),
    #[error("no instance with {0} found")]
    NotFound(String),
    #[error("index {index} out of range for {len} instance(s)")]
    IndexOutOfRange { index: isize, len: usize },
    #[error("instance {id} in invalid state {state:?} (expected {expected:?})")]
    InvalidState {
        id: InstanceId,
        state: InstanceState,
        expected: InstanceState,
    },
    #[error("no machine image found in region {0}")]
    ImageNotFound(Region),
    #[error("provider call failed in {} region(s): {}", .failures.len(), render_failures(.failures))]
    Provider { failures: Vec<(Region, Ec2Error)> },
    #[error("fleet did not converge within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn render_failures(failures: &[(Region, Ec2Error)]) -> String {
    failures
        .iter()
        .map(|(region, error)| format!("{}: {}", region, error))
        .collect::<Vec<_>>()
        .join("; ")
}
