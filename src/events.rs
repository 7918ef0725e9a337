use crate::gateway::Transition;
use crate::instance::InstanceId;
use crate::regions::Region;
use std::path::PathBuf;

/// Lifecycle events emitted by the fleet registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    Refreshed {
        regions: usize,
        instances: usize,
    },
    Discovered {
        id: InstanceId,
        region: Region,
    },
    PollTick {
        iteration: usize,
    },
    Converged {
        iterations: usize,
    },
    TransitionRequested {
        transition: Transition,
        region: Region,
        ids: Vec<InstanceId>,
        dry_run: bool,
    },
    ImageSelected {
        region: Region,
        image_id: String,
    },
    LaunchPlanned {
        plan: Vec<(Region, usize)>,
        running: usize,
        to_launch: usize,
    },
    LaunchAborted,
    Launched {
        region: Region,
        count: usize,
    },
    SecurityGroupDeleted {
        region: Region,
    },
    SecurityGroupCreated {
        region: Region,
    },
    IngressAuthorized {
        region: Region,
        port: u16,
    },
    NodeListWritten {
        path: PathBuf,
        hosts: usize,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: FleetEvent);
}

/// Renders every event as a single `tracing` line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: FleetEvent) {
        match event {
            FleetEvent::Refreshed { regions, instances } => {
                tracing::debug!(
                    "refreshed {} instance(s) in {} region(s)",
                    instances,
                    regions
                );
            }
            FleetEvent::Discovered { id, region } => {
                tracing::info!("discovered instance {} in {}", id, region);
            }
            FleetEvent::PollTick { iteration } => {
                tracing::info!("waiting... ({})", iteration);
            }
            FleetEvent::Converged { iterations } => {
                tracing::info!("done after {} poll(s)", iterations);
            }
            FleetEvent::TransitionRequested {
                transition,
                region,
                ids,
                dry_run,
            } => {
                tracing::info!(
                    "{}: {} {} instance(s){}",
                    region.label(),
                    transition.name(),
                    ids.len(),
                    if dry_run { " (dry run)" } else { "" }
                );
            }
            FleetEvent::ImageSelected { region, image_id } => {
                tracing::info!("{}: using image {}", region.label(), image_id);
            }
            FleetEvent::LaunchPlanned {
                plan,
                running,
                to_launch,
            } => {
                tracing::info!("launch plan:");
                for (region, count) in plan {
                    tracing::info!("    {:<41} {:>3}", region.label(), count);
                }
                tracing::info!("currently running instances:   {:>3}", running);
                tracing::info!("instances to launch:           {:>3}", to_launch);
                tracing::info!(
                    "instances after launch:        {:>3}",
                    running + to_launch
                );
            }
            FleetEvent::LaunchAborted => tracing::warn!("launch aborted"),
            FleetEvent::Launched { region, count } => {
                tracing::info!(
                    "{}: launched {} instance(s)",
                    region.label(),
                    count
                );
            }
            FleetEvent::SecurityGroupDeleted { region } => {
                tracing::info!("{}: deleted security group", region.label());
            }
            FleetEvent::SecurityGroupCreated { region } => {
                tracing::info!("{}: created security group", region.label());
            }
            FleetEvent::IngressAuthorized { region, port } => {
                tracing::info!(
                    "{}: opened tcp port {}",
                    region.label(),
                    port
                );
            }
            FleetEvent::NodeListWritten { path, hosts } => {
                tracing::info!(
                    "updated {} with {} running instance(s)",
                    path.display(),
                    hosts
                );
            }
        }
    }
}
