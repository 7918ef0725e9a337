#![deny(rust_2018_idioms)]

// This module contains the `args!` macro and small file helpers.
pub mod util;

pub mod bench;
pub mod config;
pub mod error;
pub mod events;
pub mod fleet;
pub mod gateway;
pub mod instance;
pub mod probe;
pub mod progress;
pub mod prompt;
pub mod regions;
pub mod remote;

#[cfg(test)]
mod testing;

// Re-export the types most callers need.
pub use config::ExperimentConfig;
pub use error::FleetError;
pub use fleet::{Fleet, Subset, Target};
pub use instance::{Instance, InstanceState};
pub use regions::{Region, RegionPlan};
