use crate::config::FleetConfig;
use crate::error::FleetError;
use crate::events::{EventSink, FleetEvent};
use crate::gateway::{Ec2Error, Gateway, LaunchRequest, Transition};
use crate::instance::{Instance, InstanceId, InstanceState};
use crate::probe::Probe;
use crate::prompt::Confirmation;
use crate::regions::{Region, RegionPlan};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

/// Read-only snapshot of some instances, in registry order. Later mutations of
/// the registry are not visible through it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subset {
    instances: Vec<Instance>,
}

impl Subset {
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter()
    }

    pub fn ids(&self) -> Vec<InstanceId> {
        self.instances.iter().map(|i| i.id().clone()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.iter().any(|i| i.id() == id)
    }

    /// Groups the ids by region, regions in order of first appearance.
    pub fn by_region(&self) -> Vec<(Region, Vec<InstanceId>)> {
        let mut groups: Vec<(Region, Vec<InstanceId>)> = Vec::new();
        for instance in &self.instances {
            match groups.iter_mut().find(|(r, _)| r == instance.region()) {
                Some((_, ids)) => ids.push(instance.id().clone()),
                None => groups
                    .push((instance.region().clone(), vec![instance.id().clone()])),
            }
        }
        groups
    }

}

impl<'a> FromIterator<&'a Instance> for Subset {
    // callers pass distinct instances
    fn from_iter<I: IntoIterator<Item = &'a Instance>>(iter: I) -> Self {
        Self {
            instances: iter.into_iter().cloned().collect(),
        }
    }
}

impl fmt::Display for Subset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids = self.ids();
        write!(f, "[{}]", ids.join(", "))
    }
}

/// What a fleet operation applies to.
pub enum Target {
    All,
    Id(InstanceId),
    /// Position in registry order; negative values count from the end.
    Index(isize),
    Ids(Vec<InstanceId>),
    Subset(Subset),
    Matching(Box<dyn Fn(&Instance) -> bool + Send + Sync>),
}

impl Target {
    pub fn matching<F>(predicate: F) -> Self
    where
        F: Fn(&Instance) -> bool + Send + Sync + 'static,
    {
        Self::Matching(Box::new(predicate))
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "All"),
            Self::Id(id) => write!(f, "Id({})", id),
            Self::Index(index) => write!(f, "Index({})", index),
            Self::Ids(ids) => write!(f, "Ids({:?})", ids),
            Self::Subset(subset) => write!(f, "Subset({})", subset),
            Self::Matching(_) => write!(f, "Matching(..)"),
        }
    }
}

/// Outcome of [`Fleet::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launch {
    /// The operator declined; nothing was launched.
    Aborted,
    Launched(Subset),
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub instances: Vec<Instance>,
    pub running_per_region: Vec<(Region, usize)>,
}

impl StatusReport {
    pub fn running(&self) -> usize {
        self.running_per_region.iter().map(|(_, count)| count).sum()
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for instance in &self.instances {
            writeln!(f, "{}", instance)?;
        }
        writeln!(f)?;
        writeln!(f, "number of running instances: {}", self.running())?;
        for (region, count) in &self.running_per_region {
            writeln!(f, "    {:<41} {:>3}", region.label(), count)?;
        }
        Ok(())
    }
}

/// Local model of every instance ever observed, across all regions.
pub struct Fleet {
    config: FleetConfig,
    gateway: Gateway,
    probe: Box<dyn Probe>,
    sink: Box<dyn EventSink>,
    instances: HashMap<InstanceId, Instance>,
    // registry order, used by `Target::Index`
    order: Vec<InstanceId>,
}

impl Fleet {
    pub fn new(
        config: FleetConfig,
        gateway: Gateway,
        probe: impl Probe + 'static,
        sink: impl EventSink + 'static,
    ) -> Self {
        Self {
            config,
            gateway,
            probe: Box::new(probe),
            sink: Box::new(sink),
            instances: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Instance> {
        self.instances.get(id)
    }

    /// All instances in registry order.
    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.order.iter().filter_map(move |id| self.instances.get(id))
    }

    fn filter(&self, predicate: impl Fn(&Instance) -> bool) -> Subset {
        self.iter().filter(|instance| predicate(instance)).collect()
    }

    fn in_state(&self, state: InstanceState) -> Subset {
        self.filter(|i| i.state() == state)
    }

    pub fn all(&self) -> Subset {
        self.filter(|_| true)
    }

    pub fn running(&self) -> Subset {
        self.in_state(InstanceState::Running)
    }

    pub fn pending(&self) -> Subset {
        self.in_state(InstanceState::Pending)
    }

    pub fn stopping(&self) -> Subset {
        self.in_state(InstanceState::Stopping)
    }

    pub fn stopped(&self) -> Subset {
        self.in_state(InstanceState::Stopped)
    }

    pub fn terminated(&self) -> Subset {
        self.in_state(InstanceState::Terminated)
    }

    /// Every instance grouped by region, regions sorted by name.
    pub fn by_region(&self) -> BTreeMap<Region, Subset> {
        let mut groups: BTreeMap<Region, Vec<&Instance>> = BTreeMap::new();
        for instance in self.iter() {
            groups
                .entry(instance.region().clone())
                .or_default()
                .push(instance);
        }
        groups
            .into_iter()
            .map(|(region, instances)| (region, instances.into_iter().collect()))
            .collect()
    }

    /// Normalizes a target into a snapshot of the instances it names.
    pub fn resolve(&self, target: &Target) -> Result<Subset, FleetError> {
        match target {
            Target::All => Ok(self.all()),
            Target::Id(id) => Ok(std::iter::once(self.lookup(id)?).collect()),
            Target::Index(index) => {
                let len = self.order.len();
                let position = if *index < 0 {
                    len.checked_sub(index.unsigned_abs())
                } else {
                    Some(*index as usize).filter(|position| *position < len)
                };
                let id = position.map(|position| &self.order[position]).ok_or(
                    FleetError::IndexOutOfRange { index: *index, len },
                )?;
                Ok(std::iter::once(self.lookup(id)?).collect())
            }
            Target::Ids(ids) => {
                // repeated ids are kept once
                let mut seen = HashSet::with_capacity(ids.len());
                ids.iter()
                    .filter(|id| seen.insert(id.as_str()))
                    .map(|id| self.lookup(id))
                    .collect()
            }
            // re-read so that the snapshot reflects the current state
            Target::Subset(subset) => subset
                .iter()
                .map(|instance| self.lookup(instance.id()))
                .collect(),
            Target::Matching(predicate) => Ok(self.filter(|i| predicate(i))),
        }
    }

    fn lookup(&self, id: &str) -> Result<&Instance, FleetError> {
        self.instances
            .get(id)
            .ok_or_else(|| FleetError::NotFound(format!("id {}", id)))
    }

    /// Id of the running instance with the given address. Non-running
    /// instances are never considered.
    pub fn instance_id(&self, address: &str) -> Result<InstanceId, FleetError> {
        self.iter()
            .find(|i| i.state().is_running() && i.dnsname() == Some(address))
            .map(|i| i.id().clone())
            .ok_or_else(|| FleetError::NotFound(format!("address {}", address)))
    }

    /// Re-reads the targeted instances from the control plane. With
    /// `Target::All` every active region is described in full, and instances
    /// not yet known are added to the registry.
    pub async fn refresh(&mut self, target: &Target) -> Result<(), FleetError> {
        let groups: Vec<(Region, Vec<InstanceId>)> = match target {
            Target::All => self
                .config
                .regions
                .iter()
                .map(|region| (region.clone(), Vec::new()))
                .collect(),
            target => self.resolve(target)?.by_region(),
        };

        let mut failures = Vec::new();
        let mut seen = 0;
        for (region, ids) in &groups {
            let described = match self.gateway.describe(region, ids).await {
                Ok(described) => described,
                Err(e) => {
                    tracing::warn!("describe in {} failed: {}", region, e);
                    failures.push((region.clone(), e));
                    continue;
                }
            };
            // parse everything first so that a bad state string leaves the
            // registry untouched
            let described = described
                .into_iter()
                .map(|(record, status)| {
                    let state = record.state.parse::<InstanceState>()?;
                    Ok((record, state, status))
                })
                .collect::<Result<Vec<_>, FleetError>>()?;
            seen += described.len();
            for (record, state, status) in described {
                let instance = self.register(&record.id, region, state);
                instance.load(&record, state, status.as_ref());
            }
        }

        self.probe_running(&groups).await;
        self.sink.emit(FleetEvent::Refreshed {
            regions: groups.len(),
            instances: seen,
        });
        if failures.is_empty() {
            Ok(())
        } else {
            Err(FleetError::Provider { failures })
        }
    }

    fn register(
        &mut self,
        id: &str,
        region: &Region,
        state: InstanceState,
    ) -> &mut Instance {
        if !self.instances.contains_key(id) {
            self.sink.emit(FleetEvent::Discovered {
                id: id.to_string(),
                region: region.clone(),
            });
            self.order.push(id.to_string());
        }
        self.instances
            .entry(id.to_string())
            .or_insert_with(|| Instance::new(id.to_string(), region.clone(), state))
    }

    // confirms reachability of running instances in the refreshed groups that
    // haven't been confirmed since they (re-)entered running
    async fn probe_running(&mut self, groups: &[(Region, Vec<InstanceId>)]) {
        let candidates: Vec<(InstanceId, String)> = self
            .iter()
            .filter(|i| {
                groups.iter().any(|(region, ids)| {
                    region == i.region() && (ids.is_empty() || ids.contains(i.id()))
                })
            })
            .filter(|i| i.state().is_running() && !i.reachable())
            .filter_map(|i| Some((i.id().clone(), i.dnsname()?.to_string())))
            .collect();
        if candidates.is_empty() {
            return;
        }

        let port = self.config.probe_port;
        let timeout = self.config.probe_timeout();
        let probe = self.probe.as_ref();
        let results = futures::future::join_all(
            candidates
                .iter()
                .map(|(_, address)| probe.probe(address, port, timeout)),
        )
        .await;
        for ((id, _), ok) in candidates.into_iter().zip(results) {
            if ok {
                if let Some(instance) = self.instances.get_mut(&id) {
                    instance.confirm_reachable();
                }
            }
        }
    }

    /// Sleeps, refreshes `scope` and re-evaluates `done` until it holds.
    /// Without a deadline this may wait forever. Returns the number of polls.
    pub async fn poll_until<P>(
        &mut self,
        scope: &Target,
        deadline: Option<Duration>,
        done: P,
    ) -> Result<usize, FleetError>
    where
        P: Fn(&Fleet) -> bool,
    {
        let start = Instant::now();
        let mut iterations = 0;
        while !done(self) {
            if let Some(deadline) = deadline {
                if start.elapsed() >= deadline {
                    return Err(FleetError::Timeout(deadline));
                }
            }
            tokio::time::sleep(self.config.refresh_interval()).await;
            self.refresh(scope).await?;
            iterations += 1;
            self.sink.emit(FleetEvent::PollTick {
                iteration: iterations,
            });
        }
        self.sink.emit(FleetEvent::Converged { iterations });
        Ok(iterations)
    }

    pub async fn start(
        &mut self,
        target: Option<Target>,
        dry_run: bool,
    ) -> Result<Subset, FleetError> {
        let targets = self.targets(target, || self.stopped())?;
        Self::check_state(&targets, InstanceState::Stopped)?;
        self.transition(Transition::Start, &targets, dry_run).await?;
        if !dry_run {
            self.await_reachable(&targets).await?;
        }
        self.resolve(&Target::Subset(targets))
    }

    pub async fn stop(
        &mut self,
        target: Option<Target>,
        dry_run: bool,
    ) -> Result<Subset, FleetError> {
        let targets = self.targets(target, || self.running())?;
        Self::check_state(&targets, InstanceState::Running)?;
        self.transition(Transition::Stop, &targets, dry_run).await?;
        if !dry_run {
            let ids = targets.ids();
            self.poll_until(
                &Target::Subset(targets.clone()),
                self.config.convergence_timeout(),
                move |fleet| {
                    fleet.all_in(&ids, |i| {
                        matches!(
                            i.state(),
                            InstanceState::Stopped | InstanceState::Terminated
                        )
                    })
                },
            )
            .await?;
        }
        self.resolve(&Target::Subset(targets))
    }

    pub async fn reboot(
        &mut self,
        target: Option<Target>,
        dry_run: bool,
    ) -> Result<Subset, FleetError> {
        let targets = self.targets(target, || self.running())?;
        Self::check_state(&targets, InstanceState::Running)?;
        self.transition(Transition::Reboot, &targets, dry_run).await?;
        if !dry_run {
            self.await_reachable(&targets).await?;
        }
        self.resolve(&Target::Subset(targets))
    }

    pub async fn terminate(
        &mut self,
        target: Option<Target>,
        dry_run: bool,
    ) -> Result<Subset, FleetError> {
        let targets = self.targets(target, || {
            self.filter(|i| i.state() != InstanceState::Terminated)
        })?;
        self.transition(Transition::Terminate, &targets, dry_run)
            .await?;
        if !dry_run {
            let ids = targets.ids();
            self.poll_until(
                &Target::Subset(targets.clone()),
                self.config.convergence_timeout(),
                move |fleet| {
                    fleet.all_in(&ids, |i| i.state() == InstanceState::Terminated)
                },
            )
            .await?;
        }
        self.resolve(&Target::Subset(targets))
    }

    /// Waits until every target is reachable. By default that's every instance
    /// that is pending or running.
    pub async fn wait_for_startup(
        &mut self,
        target: Option<Target>,
    ) -> Result<Subset, FleetError> {
        let targets = self.targets(target, || {
            self.filter(|i| {
                matches!(i.state(), InstanceState::Pending | InstanceState::Running)
            })
        })?;
        self.await_reachable(&targets).await?;
        self.resolve(&Target::Subset(targets))
    }

    /// Launches the shortfall between `plan` and the instances currently
    /// running in each region, once the operator confirms. Returns once the
    /// new instances are reachable.
    pub async fn create(
        &mut self,
        plan: &RegionPlan,
        confirmation: &dyn Confirmation,
        dry_run: bool,
    ) -> Result<Launch, FleetError> {
        let regions = plan.regions();

        // image lookups are read-only, so they may happen before confirming
        let mut failures = Vec::new();
        for region in &regions {
            let loaded = self
                .gateway
                .load_image_ids(
                    std::slice::from_ref(region),
                    &self.config.image_owner,
                    &self.config.image_name_pattern,
                )
                .await;
            match loaded {
                Ok(loaded) => {
                    for (region, image_id) in loaded {
                        let image_id =
                            image_id.ok_or(FleetError::ImageNotFound(region.clone()))?;
                        self.sink
                            .emit(FleetEvent::ImageSelected { region, image_id });
                    }
                }
                Err(e) => failures.push((region.clone(), e)),
            }
        }
        if !failures.is_empty() {
            return Err(FleetError::Provider { failures });
        }

        let running = self.running();
        let running_per_region = running.by_region();
        let shortfall: Vec<(Region, usize)> = regions
            .iter()
            .map(|region| {
                let current = running_per_region
                    .iter()
                    .find(|(r, _)| r == region)
                    .map(|(_, ids)| ids.len())
                    .unwrap_or(0);
                (region.clone(), plan.count(region).saturating_sub(current))
            })
            .collect();
        let to_launch = shortfall.iter().map(|(_, count)| count).sum();
        self.sink.emit(FleetEvent::LaunchPlanned {
            plan: shortfall.clone(),
            running: running.len(),
            to_launch,
        });
        if to_launch == 0 {
            return Ok(Launch::Launched(Subset::default()));
        }

        let user_data = match &self.config.bootstrap_script {
            Some(path) => tokio::fs::read_to_string(path).await?,
            None => String::new(),
        };

        let question = format!("launch {} instance(s)?", to_launch);
        if !confirmation.confirm(&question) {
            self.sink.emit(FleetEvent::LaunchAborted);
            return Ok(Launch::Aborted);
        }

        let mut launched = Vec::new();
        for (region, count) in shortfall.into_iter().filter(|(_, c)| *c > 0) {
            let request = self.launch_request(&region, count, &user_data)?;
            let records = match self.gateway.launch(&region, &request, dry_run).await {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!("launch in {} failed: {}", region, e);
                    failures.push((region, e));
                    continue;
                }
            };
            self.sink.emit(FleetEvent::Launched {
                region: region.clone(),
                count: records.len(),
            });
            for record in records {
                let state = record.state.parse::<InstanceState>()?;
                let instance = self.register(&record.id, &region, state);
                instance.load(&record, state, None);
                launched.push(record.id);
            }
        }
        if !failures.is_empty() {
            return Err(FleetError::Provider { failures });
        }
        if dry_run {
            return Ok(Launch::Launched(Subset::default()));
        }

        self.refresh(&Target::All).await?;
        let targets = self.resolve(&Target::Ids(launched))?;
        self.await_reachable(&targets).await?;
        self.resolve(&Target::Subset(targets)).map(Launch::Launched)
    }

    fn launch_request(
        &self,
        region: &Region,
        count: usize,
        user_data: &str,
    ) -> Result<LaunchRequest, FleetError> {
        let image_id = self
            .gateway
            .image_id(region)
            .ok_or_else(|| FleetError::ImageNotFound(region.clone()))?;
        Ok(LaunchRequest {
            image_id: image_id.to_string(),
            instance_type: self.config.instance_type.clone(),
            count,
            user_data: user_data.to_string(),
            security_group: self.config.security_group.clone(),
            key_name: self.config.key_name.clone(),
            shutdown_behavior: self.config.shutdown_behavior.clone(),
        })
    }

    /// Refreshes everything and reports every instance and the number of
    /// running instances per region.
    pub async fn status(&mut self) -> Result<StatusReport, FleetError> {
        self.refresh(&Target::All).await?;
        let running_per_region = self
            .running()
            .by_region()
            .into_iter()
            .map(|(region, ids)| (region, ids.len()))
            .collect();
        Ok(StatusReport {
            instances: self.iter().cloned().collect(),
            running_per_region,
        })
    }

    /// Writes one `address:port` line per running instance, sorted. The file
    /// is only written if its content changes; returns whether it was.
    pub fn write_node_list(
        &self,
        path: &Path,
        port: u16,
    ) -> Result<bool, FleetError> {
        let running = self.running();
        let mut addresses: Vec<&str> =
            running.iter().filter_map(|i| i.dnsname()).collect();
        addresses.sort_unstable();
        let content: String = addresses
            .iter()
            .map(|address| format!("{}:{}\n", address, port))
            .collect();

        let current = match std::fs::read_to_string(path) {
            Ok(current) => current,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        if current == content {
            return Ok(false);
        }
        std::fs::write(path, content)?;
        self.sink.emit(FleetEvent::NodeListWritten {
            path: path.to_path_buf(),
            hosts: addresses.len(),
        });
        Ok(true)
    }

    /// Deletes the configured security group in every active region (when it
    /// exists), creates it again and opens the configured ports.
    pub async fn recreate_security_groups(&mut self) -> Result<(), FleetError> {
        let mut failures = Vec::new();
        for region in self.config.regions.clone() {
            if let Err(e) = self.recreate_security_group(&region).await {
                tracing::warn!("security group in {} failed: {}", region, e);
                failures.push((region, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(FleetError::Provider { failures })
        }
    }

    async fn recreate_security_group(&self, region: &Region) -> Result<(), Ec2Error> {
        let ec2 = self.gateway.ec2();
        let name = &self.config.security_group;
        let existing = ec2.security_group_names(region).await?;
        if existing.iter().any(|group| group == name) {
            ec2.delete_security_group(region, name).await?;
            self.sink.emit(FleetEvent::SecurityGroupDeleted {
                region: region.clone(),
            });
        }
        ec2.create_security_group(
            region,
            name,
            &self.config.security_group_description,
        )
        .await?;
        self.sink.emit(FleetEvent::SecurityGroupCreated {
            region: region.clone(),
        });
        for port in &self.config.ingress_ports {
            ec2.authorize_ingress(region, name, *port).await?;
            self.sink.emit(FleetEvent::IngressAuthorized {
                region: region.clone(),
                port: *port,
            });
        }
        Ok(())
    }

    fn targets(
        &self,
        target: Option<Target>,
        default: impl FnOnce() -> Subset,
    ) -> Result<Subset, FleetError> {
        match target {
            Some(target) => self.resolve(&target),
            None => Ok(default()),
        }
    }

    fn check_state(
        targets: &Subset,
        expected: InstanceState,
    ) -> Result<(), FleetError> {
        match targets.iter().find(|i| i.state() != expected) {
            Some(instance) => Err(FleetError::InvalidState {
                id: instance.id().clone(),
                state: instance.state(),
                expected,
            }),
            None => Ok(()),
        }
    }

    fn all_in(&self, ids: &[InstanceId], predicate: impl Fn(&Instance) -> bool) -> bool {
        ids.iter()
            .all(|id| self.instances.get(id).map_or(false, |i| predicate(i)))
    }

    // issues one provider call per region; every region is attempted even if
    // an earlier one fails
    async fn transition(
        &mut self,
        transition: Transition,
        targets: &Subset,
        dry_run: bool,
    ) -> Result<(), FleetError> {
        let optimistic = match transition {
            Transition::Start | Transition::Reboot => InstanceState::Pending,
            Transition::Stop => InstanceState::Stopping,
            Transition::Terminate => InstanceState::ShuttingDown,
        };
        let mut failures = Vec::new();
        for (region, ids) in targets.by_region() {
            self.sink.emit(FleetEvent::TransitionRequested {
                transition,
                region: region.clone(),
                ids: ids.clone(),
                dry_run,
            });
            let result = self
                .gateway
                .transition(transition, &region, &ids, dry_run)
                .await;
            match result {
                Ok(()) if !dry_run => {
                    for id in &ids {
                        if let Some(instance) = self.instances.get_mut(id) {
                            instance.apply_observed(optimistic);
                        }
                    }
                }
                Ok(()) => {}
                Err(e) => {
                    tracing::warn!(
                        "{} in {} failed: {}",
                        transition.name(),
                        region,
                        e
                    );
                    failures.push((region, e));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(FleetError::Provider { failures })
        }
    }

    async fn await_reachable(&mut self, targets: &Subset) -> Result<usize, FleetError> {
        let ids = targets.ids();
        self.poll_until(
            &Target::Subset(targets.clone()),
            self.config.convergence_timeout(),
            move |fleet| fleet.all_in(&ids, Instance::reachable),
        )
        .await
    }
}
