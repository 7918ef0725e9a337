use super::{Ec2, Ec2Error, ImageRecord, InstanceRecord, LaunchRequest, StatusRecord};
use crate::instance::InstanceId;
use crate::regions::Region;
use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use futures::future::BoxFuture;
use rusoto_core::{HttpClient, RusotoError};
use rusoto_credential::DefaultCredentialsProvider;
use rusoto_ec2::Ec2 as _;
use rusoto_ec2::Ec2Client;
use std::collections::HashMap;

// the provider reports a successful dry run as an error with this code
const DRY_RUN_OPERATION: &str = "DryRunOperation";

/// Control plane backed by one `rusoto_ec2` client per region.
pub struct AwsEc2 {
    clients: HashMap<Region, Ec2Client>,
}

impl AwsEc2 {
    pub fn new(regions: &[Region]) -> Result<Self, Report> {
        let mut clients = HashMap::with_capacity(regions.len());
        for region in regions {
            let rusoto_region = region
                .name()
                .parse::<rusoto_core::Region>()
                .wrap_err_with(|| format!("unknown aws region {}", region))?;
            let dispatcher = HttpClient::new().wrap_err("http client")?;
            let credentials =
                DefaultCredentialsProvider::new().wrap_err("aws credentials")?;
            let client =
                Ec2Client::new_with(dispatcher, credentials, rusoto_region);
            clients.insert(region.clone(), client);
        }
        Ok(Self { clients })
    }

    fn client(&self, region: &Region) -> Result<&Ec2Client, Ec2Error> {
        self.clients
            .get(region)
            .ok_or_else(|| Ec2Error::UnknownRegion(region.clone()))
    }
}

fn api_error<E: std::error::Error + 'static>(
    region: &Region,
    operation: &'static str,
    error: RusotoError<E>,
) -> Ec2Error {
    let message = error.to_string();
    if message.contains(DRY_RUN_OPERATION) {
        Ec2Error::DryRun
    } else {
        Ec2Error::Api {
            region: region.clone(),
            operation,
            message,
        }
    }
}

fn to_record(instance: rusoto_ec2::Instance) -> Option<InstanceRecord> {
    let id = instance.instance_id?;
    let state = instance
        .state
        .and_then(|state| state.name)
        .unwrap_or_default();
    Some(InstanceRecord {
        id,
        dnsname: instance.public_dns_name,
        state,
    })
}

fn ids_filter(ids: &[InstanceId]) -> Option<Vec<String>> {
    if ids.is_empty() {
        None
    } else {
        Some(ids.to_vec())
    }
}

impl Ec2 for AwsEc2 {
    fn describe_instances<'a>(
        &'a self,
        region: &'a Region,
        ids: &'a [InstanceId],
    ) -> BoxFuture<'a, Result<Vec<InstanceRecord>, Ec2Error>> {
        Box::pin(async move {
            let client = self.client(region)?;
            let mut records = Vec::new();
            let mut next_token = None;
            loop {
                let request = rusoto_ec2::DescribeInstancesRequest {
                    instance_ids: ids_filter(ids),
                    next_token: next_token.take(),
                    ..Default::default()
                };
                let result = client
                    .describe_instances(request)
                    .await
                    .map_err(|e| api_error(region, "DescribeInstances", e))?;
                records.extend(
                    result
                        .reservations
                        .unwrap_or_default()
                        .into_iter()
                        .flat_map(|reservation| {
                            reservation.instances.unwrap_or_default()
                        })
                        .filter_map(to_record),
                );
                match result.next_token {
                    Some(token) if !token.is_empty() => next_token = Some(token),
                    _ => break,
                }
            }
            Ok(records)
        })
    }

    fn describe_instance_status<'a>(
        &'a self,
        region: &'a Region,
        ids: &'a [InstanceId],
    ) -> BoxFuture<'a, Result<Vec<StatusRecord>, Ec2Error>> {
        Box::pin(async move {
            let client = self.client(region)?;
            let mut records = Vec::new();
            let mut next_token = None;
            loop {
                let request = rusoto_ec2::DescribeInstanceStatusRequest {
                    instance_ids: ids_filter(ids),
                    next_token: next_token.take(),
                    ..Default::default()
                };
                let result = client
                    .describe_instance_status(request)
                    .await
                    .map_err(|e| {
                        api_error(region, "DescribeInstanceStatus", e)
                    })?;
                records.extend(
                    result
                        .instance_statuses
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|status| {
                            Some(StatusRecord {
                                id: status.instance_id?,
                                status: status
                                    .instance_status
                                    .and_then(|summary| summary.status),
                            })
                        }),
                );
                match result.next_token {
                    Some(token) if !token.is_empty() => next_token = Some(token),
                    _ => break,
                }
            }
            Ok(records)
        })
    }

    fn start_instances<'a>(
        &'a self,
        region: &'a Region,
        ids: &'a [InstanceId],
        dry_run: bool,
    ) -> BoxFuture<'a, Result<(), Ec2Error>> {
        Box::pin(async move {
            let request = rusoto_ec2::StartInstancesRequest {
                instance_ids: ids.to_vec(),
                dry_run: Some(dry_run),
                ..Default::default()
            };
            self.client(region)?
                .start_instances(request)
                .await
                .map(|_| ())
                .map_err(|e| api_error(region, "StartInstances", e))
        })
    }

    fn stop_instances<'a>(
        &'a self,
        region: &'a Region,
        ids: &'a [InstanceId],
        dry_run: bool,
    ) -> BoxFuture<'a, Result<(), Ec2Error>> {
        Box::pin(async move {
            let request = rusoto_ec2::StopInstancesRequest {
                instance_ids: ids.to_vec(),
                dry_run: Some(dry_run),
                ..Default::default()
            };
            self.client(region)?
                .stop_instances(request)
                .await
                .map(|_| ())
                .map_err(|e| api_error(region, "StopInstances", e))
        })
    }

    fn reboot_instances<'a>(
        &'a self,
        region: &'a Region,
        ids: &'a [InstanceId],
        dry_run: bool,
    ) -> BoxFuture<'a, Result<(), Ec2Error>> {
        Box::pin(async move {
            let request = rusoto_ec2::RebootInstancesRequest {
                instance_ids: ids.to_vec(),
                dry_run: Some(dry_run),
            };
            self.client(region)?
                .reboot_instances(request)
                .await
                .map(|_| ())
                .map_err(|e| api_error(region, "RebootInstances", e))
        })
    }

    fn terminate_instances<'a>(
        &'a self,
        region: &'a Region,
        ids: &'a [InstanceId],
        dry_run: bool,
    ) -> BoxFuture<'a, Result<(), Ec2Error>> {
        Box::pin(async move {
            let request = rusoto_ec2::TerminateInstancesRequest {
                instance_ids: ids.to_vec(),
                dry_run: Some(dry_run),
            };
            self.client(region)?
                .terminate_instances(request)
                .await
                .map(|_| ())
                .map_err(|e| api_error(region, "TerminateInstances", e))
        })
    }

    fn run_instances<'a>(
        &'a self,
        region: &'a Region,
        launch: &'a LaunchRequest,
        dry_run: bool,
    ) -> BoxFuture<'a, Result<Vec<InstanceRecord>, Ec2Error>> {
        Box::pin(async move {
            let count = launch.count as i64;
            let request = rusoto_ec2::RunInstancesRequest {
                image_id: Some(launch.image_id.clone()),
                instance_type: Some(launch.instance_type.clone()),
                key_name: Some(launch.key_name.clone()),
                min_count: count,
                max_count: count,
                // the api expects user data base64-encoded
                user_data: Some(base64::encode(&launch.user_data)),
                security_groups: Some(vec![launch.security_group.clone()]),
                instance_initiated_shutdown_behavior: Some(
                    launch.shutdown_behavior.clone(),
                ),
                dry_run: Some(dry_run),
                ..Default::default()
            };
            let reservation = self
                .client(region)?
                .run_instances(request)
                .await
                .map_err(|e| api_error(region, "RunInstances", e))?;
            let records = reservation
                .instances
                .unwrap_or_default()
                .into_iter()
                .filter_map(to_record)
                .collect();
            Ok(records)
        })
    }

    fn describe_images<'a>(
        &'a self,
        region: &'a Region,
        owner: &'a str,
        name_pattern: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ImageRecord>, Ec2Error>> {
        Box::pin(async move {
            let request = rusoto_ec2::DescribeImagesRequest {
                owners: Some(vec![owner.to_string()]),
                filters: Some(vec![rusoto_ec2::Filter {
                    name: Some(String::from("name")),
                    values: Some(vec![name_pattern.to_string()]),
                }]),
                ..Default::default()
            };
            let result = self
                .client(region)?
                .describe_images(request)
                .await
                .map_err(|e| api_error(region, "DescribeImages", e))?;
            let images = result
                .images
                .unwrap_or_default()
                .into_iter()
                .filter_map(|image| {
                    Some(ImageRecord {
                        id: image.image_id?,
                        creation_date: image.creation_date.unwrap_or_default(),
                    })
                })
                .collect();
            Ok(images)
        })
    }

    fn security_group_names<'a>(
        &'a self,
        region: &'a Region,
    ) -> BoxFuture<'a, Result<Vec<String>, Ec2Error>> {
        Box::pin(async move {
            let result = self
                .client(region)?
                .describe_security_groups(Default::default())
                .await
                .map_err(|e| api_error(region, "DescribeSecurityGroups", e))?;
            let names = result
                .security_groups
                .unwrap_or_default()
                .into_iter()
                .filter_map(|group| group.group_name)
                .collect();
            Ok(names)
        })
    }

    fn delete_security_group<'a>(
        &'a self,
        region: &'a Region,
        name: &'a str,
    ) -> BoxFuture<'a, Result<(), Ec2Error>> {
        Box::pin(async move {
            let request = rusoto_ec2::DeleteSecurityGroupRequest {
                group_name: Some(name.to_string()),
                ..Default::default()
            };
            self.client(region)?
                .delete_security_group(request)
                .await
                .map(|_| ())
                .map_err(|e| api_error(region, "DeleteSecurityGroup", e))
        })
    }

    fn create_security_group<'a>(
        &'a self,
        region: &'a Region,
        name: &'a str,
        description: &'a str,
    ) -> BoxFuture<'a, Result<(), Ec2Error>> {
        Box::pin(async move {
            let request = rusoto_ec2::CreateSecurityGroupRequest {
                group_name: name.to_string(),
                description: description.to_string(),
                ..Default::default()
            };
            self.client(region)?
                .create_security_group(request)
                .await
                .map(|_| ())
                .map_err(|e| api_error(region, "CreateSecurityGroup", e))
        })
    }

    fn authorize_ingress<'a>(
        &'a self,
        region: &'a Region,
        name: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<(), Ec2Error>> {
        Box::pin(async move {
            let request = rusoto_ec2::AuthorizeSecurityGroupIngressRequest {
                group_name: Some(name.to_string()),
                ip_protocol: Some(String::from("tcp")),
                from_port: Some(port as i64),
                to_port: Some(port as i64),
                cidr_ip: Some(String::from("0.0.0.0/0")),
                ..Default::default()
            };
            self.client(region)?
                .authorize_security_group_ingress(request)
                .await
                .map(|_| ())
                .map_err(|e| {
                    api_error(region, "AuthorizeSecurityGroupIngress", e)
                })
        })
    }
}
