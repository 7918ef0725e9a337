use serde::{Deserialize, Serialize};
use std::fmt;

/// All regions we know a label for, in the order instances should be placed.
pub const KNOWN_REGIONS: &[(&str, &str)] = &[
    ("eu-west-3", "EU (Paris, eu-west-3)"),
    ("us-east-1", "US East (N. Virginia, us-east-1)"),
    ("us-west-1", "US West (N. California, us-west-1)"),
    ("ap-southeast-1", "Asia Pacific (Singapore, ap-southeast-1)"),
    ("ap-northeast-1", "Asia Pacific (Tokyo, ap-northeast-1)"),
    ("eu-west-1", "EU (Ireland, eu-west-1)"),
    ("ca-central-1", "Canada (Central, ca-central-1)"),
    ("eu-west-2", "EU (London, eu-west-2)"),
    // the following are either limited to very few micro instances or don't
    // support the instance configuration we use
    ("ap-south-1", "Asia Pacific (Mumbai, ap-south-1)"),
    ("sa-east-1", "South America (Sao Paulo, sa-east-1)"),
    ("eu-central-1", "EU (Frankfurt, eu-central-1)"),
    ("eu-north-1", "EU (Stockholm, eu-north-1)"),
    ("us-east-2", "US East (Ohio, us-east-2)"),
    ("us-west-2", "US West (Oregon, us-west-2)"),
    ("ap-northeast-2", "Asia Pacific (Seoul, ap-northeast-2)"),
    ("ap-southeast-2", "Asia Pacific (Sydney, ap-southeast-2)"),
];

/// Regions used when the configuration doesn't say otherwise.
pub const DEFAULT_REGIONS: &[&str] = &[
    "eu-west-3",
    "us-east-1",
    "us-west-1",
    "ap-southeast-1",
    "ap-northeast-1",
    "eu-west-1",
    "ca-central-1",
    "eu-west-2",
];

#[derive(
    Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct Region {
    name: String,
}

impl Region {
    /// Create a new `Region`.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Region { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human readable label; falls back to the region name when unknown.
    pub fn label(&self) -> &str {
        KNOWN_REGIONS
            .iter()
            .find(|(name, _)| *name == self.name)
            .map(|(_, label)| *label)
            .unwrap_or(&self.name)
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

pub fn default_regions() -> Vec<Region> {
    DEFAULT_REGIONS.iter().map(|name| Region::new(*name)).collect()
}

/// Desired number of instances per region, in placement order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionPlan {
    counts: Vec<(Region, usize)>,
}

impl RegionPlan {
    pub fn new(counts: Vec<(Region, usize)>) -> Self {
        Self { counts }
    }

    /// Spreads `instance_count` instances over `regions` round-robin, so that
    /// the first regions get one more instance when the count doesn't divide
    /// evenly.
    pub fn distribute(instance_count: usize, regions: &[Region]) -> Self {
        let mut counts: Vec<_> =
            regions.iter().map(|region| (region.clone(), 0)).collect();
        if !counts.is_empty() {
            for index in 0..instance_count {
                counts[index % regions.len()].1 += 1;
            }
        }
        Self { counts }
    }

    pub fn count(&self, region: &Region) -> usize {
        self.counts
            .iter()
            .find(|(r, _)| r == region)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.iter().map(|(_, count)| count).sum()
    }

    /// Regions with a positive count.
    pub fn regions(&self) -> Vec<Region> {
        self.counts
            .iter()
            .filter(|(_, count)| *count > 0)
            .map(|(region, _)| region.clone())
            .collect()
    }
}
