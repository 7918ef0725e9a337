use crate::error::FleetError;
use crate::gateway::{InstanceRecord, StatusRecord};
use crate::regions::Region;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type InstanceId = String;

/// Lifecycle state of an instance as reported by the control plane.
///
/// `Pending -> Running -> ShuttingDown -> Terminated` and
/// `Running -> Stopping -> Stopped -> Pending` (via start). `Terminated` is
/// absorbing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_running(&self) -> bool {
        self == &Self::Running
    }
}

impl FromStr for InstanceState {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // provider names use dashes, we also accept underscores
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "shutting-down" => Ok(Self::ShuttingDown),
            "terminated" => Ok(Self::Terminated),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            _ => Err(FleetError::UnknownState(s.to_string())),
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    id: InstanceId,
    region: Region,
    dnsname: Option<String>,
    state: InstanceState,
    // only true while running and after a successful probe
    reachable: bool,
    status: Option<String>,
}

impl Instance {
    pub fn new(id: InstanceId, region: Region, state: InstanceState) -> Self {
        Self {
            id,
            region,
            dnsname: None,
            state,
            reachable: false,
            status: None,
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn dnsname(&self) -> Option<&str> {
        self.dnsname.as_deref()
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn reachable(&self) -> bool {
        self.reachable
    }

    /// Provider health-check string (advisory only).
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    /// Updates the lifecycle state together with the reachability flag:
    /// leaving `Running` always clears it, and so does (re-)entering
    /// `Running`, since reachability has to be confirmed again.
    pub fn apply_observed(&mut self, state: InstanceState) {
        if !(state.is_running() && self.state.is_running()) {
            self.reachable = false;
        }
        self.state = state;
    }

    /// Marks the instance as reachable. Ignored unless the instance is running
    /// and has an address.
    pub fn confirm_reachable(&mut self) -> bool {
        self.reachable = self.state.is_running() && self.dnsname.is_some();
        self.reachable
    }

    /// Applies freshly observed provider records. The state must have been
    /// parsed beforehand so that a bad state string never leaves the instance
    /// half-updated.
    pub(crate) fn load(
        &mut self,
        record: &InstanceRecord,
        state: InstanceState,
        status: Option<&StatusRecord>,
    ) {
        debug_assert_eq!(self.id, record.id);
        self.dnsname = record
            .dnsname
            .as_ref()
            .filter(|dnsname| !dnsname.is_empty())
            .cloned();
        self.apply_observed(state);
        self.status = status.and_then(|status| status.status.clone());
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Instance(id='{}', region='{}', dnsname='{}', state='{}', reachable='{}', status='{}')",
            self.id,
            self.region,
            self.dnsname.as_deref().unwrap_or(""),
            self.state,
            self.reachable,
            self.status().unwrap_or("")
        )
    }
}
