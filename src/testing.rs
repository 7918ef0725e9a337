// Fakes shared by the unit tests.
use crate::events::{EventSink, FleetEvent};
use crate::gateway::{
    Ec2, Ec2Error, ImageRecord, InstanceRecord, LaunchRequest, StatusRecord,
};
use crate::instance::InstanceId;
use crate::probe::Probe;
use crate::prompt::Confirmation;
use crate::regions::Region;
use crate::remote::{Output, RemoteProcess, RemoteShell, TransportError};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub region: Region,
    pub ids: Vec<InstanceId>,
    pub dry_run: bool,
}

#[derive(Debug)]
struct FakeInstance {
    region: Region,
    id: InstanceId,
    state: String,
    dnsname: Option<String>,
}

#[derive(Debug, Default)]
struct FakeEc2State {
    regions: Vec<Region>,
    instances: Vec<FakeInstance>,
    images: Vec<(Region, ImageRecord)>,
    groups: HashMap<Region, Vec<String>>,
    ingress: Vec<(Region, String, u16)>,
    failing: HashSet<(Region, &'static str)>,
    calls: Vec<(&'static str, Call)>,
    launched: usize,
}

/// In-memory control plane. Transitional states advance by one step after
/// every `describe_instances` of their region.
#[derive(Debug, Clone, Default)]
pub struct FakeEc2 {
    state: Arc<Mutex<FakeEc2State>>,
}

fn dnsname(id: &str, region: &Region) -> String {
    format!("{}.{}.compute.example.com", id, region)
}

fn next_state(state: &str) -> Option<&'static str> {
    match state {
        "pending" => Some("running"),
        "stopping" => Some("stopped"),
        "shutting-down" => Some("terminated"),
        _ => None,
    }
}

impl FakeEc2 {
    pub fn new(regions: &[Region]) -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().regions = regions.to_vec();
        fake
    }

    /// Adds an instance; running instances get an address right away.
    pub fn add_instance(&self, region: &Region, id: &str, state: &str) {
        let mut inner = self.state.lock().unwrap();
        inner.instances.push(FakeInstance {
            region: region.clone(),
            id: id.to_string(),
            state: state.to_string(),
            dnsname: (state == "running").then(|| dnsname(id, region)),
        });
    }

    /// Changes the state of an instance behind the registry's back.
    pub fn set_state(&self, id: &str, state: &str) {
        let mut inner = self.state.lock().unwrap();
        if let Some(instance) = inner.instances.iter_mut().find(|i| i.id == id) {
            if state == "running" && instance.dnsname.is_none() {
                instance.dnsname = Some(dnsname(id, &instance.region));
            }
            instance.state = state.to_string();
        }
    }

    pub fn state_of(&self, id: &str) -> Option<String> {
        let inner = self.state.lock().unwrap();
        inner
            .instances
            .iter()
            .find(|i| i.id == id)
            .map(|i| i.state.clone())
    }

    pub fn add_image(&self, region: &Region, id: &str, creation_date: &str) {
        self.state.lock().unwrap().images.push((
            region.clone(),
            ImageRecord {
                id: id.to_string(),
                creation_date: creation_date.to_string(),
            },
        ));
    }

    pub fn add_security_group(&self, region: &Region, name: &str) {
        let mut inner = self.state.lock().unwrap();
        inner
            .groups
            .entry(region.clone())
            .or_default()
            .push(name.to_string());
    }

    pub fn security_groups(&self, region: &Region) -> Vec<String> {
        let inner = self.state.lock().unwrap();
        inner.groups.get(region).cloned().unwrap_or_default()
    }

    pub fn ingress(&self, region: &Region) -> Vec<u16> {
        let inner = self.state.lock().unwrap();
        inner
            .ingress
            .iter()
            .filter(|(r, _, _)| r == region)
            .map(|(_, _, port)| *port)
            .collect()
    }

    /// Makes `operation` fail in `region` from now on.
    pub fn fail(&self, region: &Region, operation: &'static str) {
        let mut inner = self.state.lock().unwrap();
        inner.failing.insert((region.clone(), operation));
    }

    pub fn calls(&self, operation: &str) -> Vec<Call> {
        let inner = self.state.lock().unwrap();
        inner
            .calls
            .iter()
            .filter(|(op, _)| *op == operation)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    // records the call and checks whether it may go ahead
    fn enter(
        &self,
        operation: &'static str,
        region: &Region,
        ids: &[InstanceId],
        dry_run: bool,
    ) -> Result<(), Ec2Error> {
        let mut inner = self.state.lock().unwrap();
        inner.calls.push((
            operation,
            Call {
                region: region.clone(),
                ids: ids.to_vec(),
                dry_run,
            },
        ));
        if !inner.regions.contains(region) {
            return Err(Ec2Error::UnknownRegion(region.clone()));
        }
        if inner.failing.contains(&(region.clone(), operation)) {
            return Err(Ec2Error::Api {
                region: region.clone(),
                operation,
                message: String::from("injected failure"),
            });
        }
        if dry_run {
            return Err(Ec2Error::DryRun);
        }
        Ok(())
    }

    fn set_states(&self, region: &Region, ids: &[InstanceId], state: &str) {
        let mut inner = self.state.lock().unwrap();
        for instance in inner.instances.iter_mut() {
            if &instance.region == region && ids.contains(&instance.id) {
                instance.state = state.to_string();
            }
        }
    }

    fn ready<'a, T: Send + 'a>(result: Result<T, Ec2Error>) -> BoxFuture<'a, Result<T, Ec2Error>> {
        Box::pin(futures::future::ready(result))
    }
}

impl Ec2 for FakeEc2 {
    fn describe_instances<'a>(
        &'a self,
        region: &'a Region,
        ids: &'a [InstanceId],
    ) -> BoxFuture<'a, Result<Vec<InstanceRecord>, Ec2Error>> {
        let result = self.enter("describe_instances", region, ids, false).map(|()| {
            let mut inner = self.state.lock().unwrap();
            let mut records = Vec::new();
            for instance in inner.instances.iter_mut() {
                if &instance.region != region
                    || !(ids.is_empty() || ids.contains(&instance.id))
                {
                    continue;
                }
                records.push(InstanceRecord {
                    id: instance.id.clone(),
                    dnsname: instance.dnsname.clone(),
                    state: instance.state.clone(),
                });
                if let Some(next) = next_state(&instance.state) {
                    instance.state = next.to_string();
                    if next == "running" {
                        instance.dnsname = Some(dnsname(&instance.id, region));
                    }
                }
            }
            records
        });
        Self::ready(result)
    }

    fn describe_instance_status<'a>(
        &'a self,
        region: &'a Region,
        ids: &'a [InstanceId],
    ) -> BoxFuture<'a, Result<Vec<StatusRecord>, Ec2Error>> {
        let result = self
            .enter("describe_instance_status", region, ids, false)
            .map(|()| {
                let inner = self.state.lock().unwrap();
                inner
                    .instances
                    .iter()
                    .filter(|i| &i.region == region)
                    .filter(|i| ids.is_empty() || ids.contains(&i.id))
                    .filter(|i| i.state == "running")
                    .map(|i| StatusRecord {
                        id: i.id.clone(),
                        status: Some(String::from("ok")),
                    })
                    .collect()
            });
        Self::ready(result)
    }

    fn start_instances<'a>(
        &'a self,
        region: &'a Region,
        ids: &'a [InstanceId],
        dry_run: bool,
    ) -> BoxFuture<'a, Result<(), Ec2Error>> {
        let result = self
            .enter("start_instances", region, ids, dry_run)
            .map(|()| self.set_states(region, ids, "pending"));
        Self::ready(result)
    }

    fn stop_instances<'a>(
        &'a self,
        region: &'a Region,
        ids: &'a [InstanceId],
        dry_run: bool,
    ) -> BoxFuture<'a, Result<(), Ec2Error>> {
        let result = self
            .enter("stop_instances", region, ids, dry_run)
            .map(|()| self.set_states(region, ids, "stopping"));
        Self::ready(result)
    }

    fn reboot_instances<'a>(
        &'a self,
        region: &'a Region,
        ids: &'a [InstanceId],
        dry_run: bool,
    ) -> BoxFuture<'a, Result<(), Ec2Error>> {
        // rebooting instances keep reporting running
        Self::ready(self.enter("reboot_instances", region, ids, dry_run))
    }

    fn terminate_instances<'a>(
        &'a self,
        region: &'a Region,
        ids: &'a [InstanceId],
        dry_run: bool,
    ) -> BoxFuture<'a, Result<(), Ec2Error>> {
        let result = self
            .enter("terminate_instances", region, ids, dry_run)
            .map(|()| self.set_states(region, ids, "shutting-down"));
        Self::ready(result)
    }

    fn run_instances<'a>(
        &'a self,
        region: &'a Region,
        request: &'a LaunchRequest,
        dry_run: bool,
    ) -> BoxFuture<'a, Result<Vec<InstanceRecord>, Ec2Error>> {
        let result = self.enter("run_instances", region, &[], dry_run).map(|()| {
            let mut inner = self.state.lock().unwrap();
            let mut records = Vec::new();
            for _ in 0..request.count {
                inner.launched += 1;
                let id = format!("i-new-{}", inner.launched);
                inner.instances.push(FakeInstance {
                    region: region.clone(),
                    id: id.clone(),
                    state: String::from("pending"),
                    dnsname: None,
                });
                records.push(InstanceRecord {
                    id,
                    dnsname: None,
                    state: String::from("pending"),
                });
            }
            records
        });
        Self::ready(result)
    }

    fn describe_images<'a>(
        &'a self,
        region: &'a Region,
        _owner: &'a str,
        _name_pattern: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ImageRecord>, Ec2Error>> {
        let result = self.enter("describe_images", region, &[], false).map(|()| {
            let inner = self.state.lock().unwrap();
            inner
                .images
                .iter()
                .filter(|(r, _)| r == region)
                .map(|(_, image)| image.clone())
                .collect()
        });
        Self::ready(result)
    }

    fn security_group_names<'a>(
        &'a self,
        region: &'a Region,
    ) -> BoxFuture<'a, Result<Vec<String>, Ec2Error>> {
        let result = self
            .enter("security_group_names", region, &[], false)
            .map(|()| self.security_groups(region));
        Self::ready(result)
    }

    fn delete_security_group<'a>(
        &'a self,
        region: &'a Region,
        name: &'a str,
    ) -> BoxFuture<'a, Result<(), Ec2Error>> {
        let result = self
            .enter("delete_security_group", region, &[], false)
            .map(|()| {
                let mut inner = self.state.lock().unwrap();
                if let Some(groups) = inner.groups.get_mut(region) {
                    groups.retain(|group| group != name);
                }
                inner.ingress.retain(|(r, group, _)| !(r == region && group == name));
            });
        Self::ready(result)
    }

    fn create_security_group<'a>(
        &'a self,
        region: &'a Region,
        name: &'a str,
        _description: &'a str,
    ) -> BoxFuture<'a, Result<(), Ec2Error>> {
        let result = self
            .enter("create_security_group", region, &[], false)
            .map(|()| self.add_security_group(region, name));
        Self::ready(result)
    }

    fn authorize_ingress<'a>(
        &'a self,
        region: &'a Region,
        name: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<(), Ec2Error>> {
        let result = self.enter("authorize_ingress", region, &[], false).map(|()| {
            let mut inner = self.state.lock().unwrap();
            inner.ingress.push((region.clone(), name.to_string(), port));
        });
        Self::ready(result)
    }
}

/// Probe that succeeds for every address that isn't blocked.
#[derive(Debug, Clone, Default)]
pub struct FakeProbe {
    blocked: Arc<Mutex<HashSet<String>>>,
    probed: Arc<Mutex<Vec<String>>>,
}

impl FakeProbe {
    pub fn block(&self, address: &str) {
        self.blocked.lock().unwrap().insert(address.to_string());
    }

    pub fn unblock(&self, address: &str) {
        self.blocked.lock().unwrap().remove(address);
    }

    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().unwrap().clone()
    }
}

impl Probe for FakeProbe {
    fn probe<'a>(
        &'a self,
        address: &'a str,
        _port: u16,
        _timeout: Duration,
    ) -> BoxFuture<'a, bool> {
        self.probed.lock().unwrap().push(address.to_string());
        let ok = !self.blocked.lock().unwrap().contains(address);
        Box::pin(futures::future::ready(ok))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<FleetEvent>>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<FleetEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&FleetEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| matches(e)).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: FleetEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Scripted operator answer; records the questions asked.
#[derive(Debug, Default)]
pub struct Answer {
    yes: bool,
    asked: Mutex<Vec<String>>,
}

impl Answer {
    pub fn yes() -> Self {
        Self {
            yes: true,
            asked: Mutex::default(),
        }
    }

    pub fn no() -> Self {
        Self::default()
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }
}

impl Confirmation for Answer {
    fn confirm(&self, question: &str) -> bool {
        self.asked.lock().unwrap().push(question.to_string());
        self.yes
    }
}

#[derive(Debug, Default)]
struct FakeShellState {
    // (host, pattern, output); the last match wins
    responses: Vec<(Option<String>, String, Output)>,
    unreachable: HashSet<String>,
    // reachable, but nothing can be started there
    no_spawn: HashSet<String>,
    // commands on these hosts never complete
    hanging: HashSet<String>,
    execs: Vec<(String, String)>,
    spawned: Vec<(String, String, bool)>,
    closed: Vec<String>,
    copied_to: Vec<(String, PathBuf, String)>,
    copied_from: Vec<(String, String, PathBuf)>,
}

/// Remote shell answering from scripted responses. Commands without a
/// matching response succeed with empty output.
#[derive(Debug, Clone, Default)]
pub struct FakeShell {
    state: Arc<Mutex<FakeShellState>>,
}

impl FakeShell {
    /// Answers commands containing `pattern` on `host` (or on every host).
    pub fn respond(&self, host: Option<&str>, pattern: &str, output: Output) {
        self.state.lock().unwrap().responses.push((
            host.map(str::to_string),
            pattern.to_string(),
            output,
        ));
    }

    pub fn unreachable(&self, host: &str) {
        self.state.lock().unwrap().unreachable.insert(host.to_string());
    }

    pub fn fail_spawn(&self, host: &str) {
        self.state.lock().unwrap().no_spawn.insert(host.to_string());
    }

    pub fn hang(&self, host: &str) {
        self.state.lock().unwrap().hanging.insert(host.to_string());
    }

    /// Hosts that ran a command containing `pattern`, in execution order.
    pub fn execs_of(&self, pattern: &str) -> Vec<String> {
        let inner = self.state.lock().unwrap();
        inner
            .execs
            .iter()
            .filter(|(_, command)| command.contains(pattern))
            .map(|(host, _)| host.clone())
            .collect()
    }

    /// Last command run on `host`.
    pub fn command_on(&self, host: &str) -> Option<String> {
        let inner = self.state.lock().unwrap();
        inner
            .execs
            .iter()
            .rev()
            .find(|(h, _)| h == host)
            .map(|(_, command)| command.clone())
    }

    pub fn spawned(&self) -> Vec<(String, String, bool)> {
        self.state.lock().unwrap().spawned.clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.state.lock().unwrap().closed.clone()
    }

    pub fn copied_to(&self) -> Vec<(String, PathBuf, String)> {
        self.state.lock().unwrap().copied_to.clone()
    }

    pub fn copied_from(&self) -> Vec<(String, String, PathBuf)> {
        self.state.lock().unwrap().copied_from.clone()
    }

    fn check_reachable(&self, host: &str) -> Result<(), TransportError> {
        if self.state.lock().unwrap().unreachable.contains(host) {
            Err(TransportError::Unreachable {
                host: host.to_string(),
                message: String::from("connection refused"),
            })
        } else {
            Ok(())
        }
    }
}

impl RemoteShell for FakeShell {
    fn exec<'a>(
        &'a self,
        host: &'a str,
        command: &'a str,
        _pty: bool,
    ) -> BoxFuture<'a, Result<Output, TransportError>> {
        if self.state.lock().unwrap().hanging.contains(host) {
            return Box::pin(futures::future::pending());
        }
        let result = self.check_reachable(host).map(|()| {
            let mut inner = self.state.lock().unwrap();
            inner.execs.push((host.to_string(), command.to_string()));
            inner
                .responses
                .iter()
                .rev()
                .find(|(h, pattern, _)| {
                    h.as_deref().map_or(true, |h| h == host)
                        && command.contains(pattern.as_str())
                })
                .map(|(_, _, output)| output.clone())
                .unwrap_or_else(|| Output::ok(""))
        });
        Box::pin(futures::future::ready(result))
    }

    fn spawn<'a>(
        &'a self,
        host: &'a str,
        command: &'a str,
        pty: bool,
    ) -> BoxFuture<'a, Result<Box<dyn RemoteProcess>, TransportError>> {
        let result = self.check_reachable(host).and_then(|()| {
            if self.state.lock().unwrap().no_spawn.contains(host) {
                return Err(TransportError::Spawn {
                    program: String::from("ssh"),
                    source: std::io::Error::from(std::io::ErrorKind::BrokenPipe),
                });
            }
            let mut inner = self.state.lock().unwrap();
            inner
                .spawned
                .push((host.to_string(), command.to_string(), pty));
            let process: Box<dyn RemoteProcess> = Box::new(FakeProcess {
                host: host.to_string(),
                state: self.state.clone(),
            });
            Ok(process)
        });
        Box::pin(futures::future::ready(result))
    }

    fn copy_to<'a>(
        &'a self,
        host: &'a str,
        local: &'a Path,
        remote: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        let result = self.check_reachable(host).map(|()| {
            let mut inner = self.state.lock().unwrap();
            inner.copied_to.push((
                host.to_string(),
                local.to_path_buf(),
                remote.to_string(),
            ));
        });
        Box::pin(futures::future::ready(result))
    }

    fn copy_from<'a>(
        &'a self,
        host: &'a str,
        remote: &'a str,
        local: &'a Path,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        let result = self.check_reachable(host).and_then(|()| {
            std::fs::write(local, format!("{}:{}", host, remote))?;
            let mut inner = self.state.lock().unwrap();
            inner.copied_from.push((
                host.to_string(),
                remote.to_string(),
                local.to_path_buf(),
            ));
            Ok(())
        });
        Box::pin(futures::future::ready(result))
    }
}

struct FakeProcess {
    host: String,
    state: Arc<Mutex<FakeShellState>>,
}

impl RemoteProcess for FakeProcess {
    fn host(&self) -> &str {
        &self.host
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>> {
        self.state.lock().unwrap().closed.push(self.host.clone());
        Box::pin(futures::future::ready(Ok(())))
    }
}

/// Fleet configuration that polls without delay.
pub fn fleet_config(regions: &[Region]) -> crate::config::FleetConfig {
    crate::config::FleetConfig {
        regions: regions.to_vec(),
        refresh_interval_ms: 1,
        probe_timeout_ms: Some(1),
        convergence_timeout_secs: Some(10),
        bootstrap_script: None,
        ..crate::config::FleetConfig::default()
    }
}

pub fn regions(names: &[&str]) -> Vec<Region> {
    names.iter().map(|name| Region::new(*name)).collect()
}
