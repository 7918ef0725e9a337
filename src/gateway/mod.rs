// This module contains the translation layer between lifecycle intents and
// the per-region control plane.
#[cfg(feature = "aws")]
pub mod aws;

use crate::instance::InstanceId;
use crate::regions::Region;
use futures::future::BoxFuture;
use std::collections::HashMap;
use thiserror::Error;

/// Instance as described by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub dnsname: Option<String>,
    pub state: String,
}

/// Health-check record of a single instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub id: InstanceId,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: String,
    pub creation_date: String,
}

/// Everything needed to launch `count` instances in one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub image_id: String,
    pub instance_type: String,
    pub count: usize,
    pub user_data: String,
    pub security_group: String,
    pub key_name: String,
    pub shutdown_behavior: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Ec2Error {
    /// The provider validated a dry-run request that would have succeeded.
    #[error("request would have succeeded, but the dry-run flag is set")]
    DryRun,
    #[error("no client for region {0}")]
    UnknownRegion(Region),
    #[error("{operation} failed in {region}: {message}")]
    Api {
        region: Region,
        operation: &'static str,
        message: String,
    },
}

/// A region-keyed view of the cloud control plane. Stateless between calls.
pub trait Ec2: Send + Sync {
    /// An empty `ids` slice describes every instance in the region.
    fn describe_instances<'a>(
        &'a self,
        region: &'a Region,
        ids: &'a [InstanceId],
    ) -> BoxFuture<'a, Result<Vec<InstanceRecord>, Ec2Error>>;

    fn describe_instance_status<'a>(
        &'a self,
        region: &'a Region,
        ids: &'a [InstanceId],
    ) -> BoxFuture<'a, Result<Vec<StatusRecord>, Ec2Error>>;

    fn start_instances<'a>(
        &'a self,
        region: &'a Region,
        ids: &'a [InstanceId],
        dry_run: bool,
    ) -> BoxFuture<'a, Result<(), Ec2Error>>;

    fn stop_instances<'a>(
        &'a self,
        region: &'a Region,
        ids: &'a [InstanceId],
        dry_run: bool,
    ) -> BoxFuture<'a, Result<(), Ec2Error>>;

    fn reboot_instances<'a>(
        &'a self,
        region: &'a Region,
        ids: &'a [InstanceId],
        dry_run: bool,
    ) -> BoxFuture<'a, Result<(), Ec2Error>>;

    fn terminate_instances<'a>(
        &'a self,
        region: &'a Region,
        ids: &'a [InstanceId],
        dry_run: bool,
    ) -> BoxFuture<'a, Result<(), Ec2Error>>;

    fn run_instances<'a>(
        &'a self,
        region: &'a Region,
        request: &'a LaunchRequest,
        dry_run: bool,
    ) -> BoxFuture<'a, Result<Vec<InstanceRecord>, Ec2Error>>;

    fn describe_images<'a>(
        &'a self,
        region: &'a Region,
        owner: &'a str,
        name_pattern: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ImageRecord>, Ec2Error>>;

    fn security_group_names<'a>(
        &'a self,
        region: &'a Region,
    ) -> BoxFuture<'a, Result<Vec<String>, Ec2Error>>;

    fn delete_security_group<'a>(
        &'a self,
        region: &'a Region,
        name: &'a str,
    ) -> BoxFuture<'a, Result<(), Ec2Error>>;

    fn create_security_group<'a>(
        &'a self,
        region: &'a Region,
        name: &'a str,
        description: &'a str,
    ) -> BoxFuture<'a, Result<(), Ec2Error>>;

    fn authorize_ingress<'a>(
        &'a self,
        region: &'a Region,
        name: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<(), Ec2Error>>;
}

/// Bulk lifecycle transition issued against a set of instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Stop,
    Reboot,
    Terminate,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reboot => "reboot",
            Self::Terminate => "terminate",
        }
    }
}

/// Turns the provider's dry-run signal into a success when the request was a
/// dry run. Any other error, and a dry-run signal for a real request, is
/// returned unchanged.
pub fn settle_dry_run<T: Default>(
    result: Result<T, Ec2Error>,
    dry_run: bool,
) -> Result<T, Ec2Error> {
    match result {
        Err(Ec2Error::DryRun) if dry_run => Ok(T::default()),
        result => result,
    }
}

pub struct Gateway {
    ec2: Box<dyn Ec2>,
    // image id per region, populated once
    images: HashMap<Region, String>,
}

impl Gateway {
    pub fn new(ec2: impl Ec2 + 'static) -> Self {
        Self {
            ec2: Box::new(ec2),
            images: HashMap::new(),
        }
    }

    pub fn ec2(&self) -> &dyn Ec2 {
        self.ec2.as_ref()
    }

    /// Describes instances and their health in `region`, merged by id.
    pub async fn describe(
        &self,
        region: &Region,
        ids: &[InstanceId],
    ) -> Result<Vec<(InstanceRecord, Option<StatusRecord>)>, Ec2Error> {
        let records = self.ec2.describe_instances(region, ids).await?;
        let mut statuses: HashMap<_, _> = self
            .ec2
            .describe_instance_status(region, ids)
            .await?
            .into_iter()
            .map(|status| (status.id.clone(), status))
            .collect();
        let merged = records
            .into_iter()
            .map(|record| {
                let status = statuses.remove(&record.id);
                (record, status)
            })
            .collect();
        Ok(merged)
    }

    pub async fn transition(
        &self,
        transition: Transition,
        region: &Region,
        ids: &[InstanceId],
        dry_run: bool,
    ) -> Result<(), Ec2Error> {
        let result = match transition {
            Transition::Start => {
                self.ec2.start_instances(region, ids, dry_run).await
            }
            Transition::Stop => self.ec2.stop_instances(region, ids, dry_run).await,
            Transition::Reboot => {
                self.ec2.reboot_instances(region, ids, dry_run).await
            }
            Transition::Terminate => {
                self.ec2.terminate_instances(region, ids, dry_run).await
            }
        };
        settle_dry_run(result, dry_run)
    }

    pub async fn launch(
        &self,
        region: &Region,
        request: &LaunchRequest,
        dry_run: bool,
    ) -> Result<Vec<InstanceRecord>, Ec2Error> {
        let result = self.ec2.run_instances(region, request, dry_run).await;
        settle_dry_run(result, dry_run)
    }

    /// Looks up the most recent matching image in every region that doesn't
    /// have one cached yet. Returns the regions that were looked up.
    pub async fn load_image_ids(
        &mut self,
        regions: &[Region],
        owner: &str,
        name_pattern: &str,
    ) -> Result<Vec<(Region, Option<String>)>, Ec2Error> {
        let mut loaded = Vec::new();
        for region in regions {
            if self.images.contains_key(region) {
                continue;
            }
            let images =
                self.ec2.describe_images(region, owner, name_pattern).await?;
            let latest = images
                .into_iter()
                .max_by(|a, b| a.creation_date.cmp(&b.creation_date))
                .map(|image| image.id);
            tracing::debug!("image for {}: {:?}", region, latest);
            if let Some(image_id) = &latest {
                self.images.insert(region.clone(), image_id.clone());
            }
            loaded.push((region.clone(), latest));
        }
        Ok(loaded)
    }

    pub fn image_id(&self, region: &Region) -> Option<&str> {
        self.images.get(region).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEc2;

    #[test]
    fn dry_run_signal() {
        // swallowed only when the request was a dry run
        assert_eq!(settle_dry_run::<()>(Err(Ec2Error::DryRun), true), Ok(()));
        assert_eq!(
            settle_dry_run::<()>(Err(Ec2Error::DryRun), false),
            Err(Ec2Error::DryRun)
        );

        // other errors always propagate
        let region = Region::new("eu-west-1");
        let error = Ec2Error::Api {
            region,
            operation: "StartInstances",
            message: "UnauthorizedOperation".into(),
        };
        assert_eq!(settle_dry_run::<()>(Err(error.clone()), true), Err(error));
    }

    #[tokio::test]
    async fn images_are_looked_up_once() {
        let eu = Region::new("eu-west-1");
        let us = Region::new("us-east-1");
        let ec2 = FakeEc2::new(&[eu.clone(), us.clone()]);
        ec2.add_image(&eu, "ami-old", "2020-01-01T00:00:00.000Z");
        ec2.add_image(&eu, "ami-new", "2021-06-01T00:00:00.000Z");
        ec2.add_image(&us, "ami-us", "2021-01-01T00:00:00.000Z");
        let mut gateway = Gateway::new(ec2.clone());

        let regions = vec![eu.clone(), us.clone()];
        let loaded = gateway.load_image_ids(&regions, "amazon", "*").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(gateway.image_id(&eu), Some("ami-new"));
        assert_eq!(gateway.image_id(&us), Some("ami-us"));

        // a second call doesn't hit the provider again
        let loaded = gateway.load_image_ids(&regions, "amazon", "*").await.unwrap();
        assert!(loaded.is_empty());
        assert_eq!(ec2.calls("describe_images").len(), 2);
    }

    #[tokio::test]
    async fn describe_merges_status() {
        let eu = Region::new("eu-west-1");
        let ec2 = FakeEc2::new(&[eu.clone()]);
        ec2.add_instance(&eu, "i-1", "running");
        ec2.add_instance(&eu, "i-2", "stopped");
        let gateway = Gateway::new(ec2.clone());

        let merged = gateway.describe(&eu, &[]).await.unwrap();
        assert_eq!(merged.len(), 2);
        for (record, status) in merged {
            // the fake only reports health for running instances
            assert_eq!(status.is_some(), record.state == "running");
        }
    }
}
