use crate::args;
use crate::config::BenchConfig;
use crate::fleet::Fleet;
use crate::progress::TracingProgressBar;
use crate::remote::{
    RemoteError, RemoteProcess, RemoteShell, RunOptions, RunResult, Script, Session,
};
use crate::util;
use chrono::{DateTime, SubsecRound, Utc};
use color_eyre::eyre::{self, WrapErr};
use color_eyre::Report;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const RUN_DIR_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const RUN_RECORD: &str = "run.json";

/// Upper bound of the round count drawn for a simulated adversary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundBound {
    /// `0..num_rounds`: adversaries always stop early.
    Exclusive,
    /// `0..=num_rounds`: an adversary may end up running every round.
    Inclusive,
}

impl Default for RoundBound {
    fn default() -> Self {
        Self::Exclusive
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchParams {
    pub num_nodes: usize,
    pub num_rounds: u64,
    // seconds; the phase durations below default to it
    pub duration: f64,
    pub propose_duration: Option<f64>,
    pub acknowledge_duration: Option<f64>,
    pub vote_duration: Option<f64>,
    pub startup_delay: u64,
    pub connection_lead_time: u64,
    // `None` runs every node honestly
    pub adversary: Option<RoundBound>,
    pub sync: bool,
}

impl BenchParams {
    pub fn new(num_nodes: usize, num_rounds: u64) -> Self {
        Self {
            num_nodes,
            num_rounds,
            duration: 2.0,
            propose_duration: None,
            acknowledge_duration: None,
            vote_duration: None,
            startup_delay: 60,
            connection_lead_time: 20,
            adversary: None,
            sync: true,
        }
    }

    pub fn propose(&self) -> f64 {
        self.propose_duration.unwrap_or(self.duration)
    }

    pub fn acknowledge(&self) -> f64 {
        self.acknowledge_duration.unwrap_or(self.duration)
    }

    pub fn vote(&self) -> f64 {
        self.vote_duration.unwrap_or(self.duration)
    }
}

/// When a run starts and is expected to end, both whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Schedule {
    pub fn new(now: DateTime<Utc>, params: &BenchParams) -> Self {
        let start =
            now.trunc_subsecs(0) + chrono::Duration::seconds(params.startup_delay as i64);
        let round = params.propose() + params.acknowledge() + params.vote();
        let total_ms = (params.num_rounds as f64 * round * 1000.0).round() as i64;
        let end = (start + chrono::Duration::milliseconds(total_ms)).trunc_subsecs(0);
        Self { start, end }
    }

    pub fn total(&self) -> chrono::Duration {
        self.end - self.start
    }

    /// Time left until the expected end; zero once it has passed.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.end - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Rounds each node runs, in node order. With an adversary, a minority of
/// `ceil(n/3) - 1` nodes gets a random smaller count; the assignment is
/// shuffled.
pub fn assign_rounds<R: Rng>(
    num_nodes: usize,
    num_rounds: u64,
    adversary: Option<RoundBound>,
    rng: &mut R,
) -> Vec<u64> {
    let bound = match adversary {
        Some(bound) => bound,
        None => return vec![num_rounds; num_nodes],
    };
    let minority = ((num_nodes + 2) / 3).saturating_sub(1);
    let mut rounds: Vec<u64> = (0..minority)
        .map(|_| match bound {
            RoundBound::Exclusive if num_rounds == 0 => 0,
            RoundBound::Exclusive => rng.gen_range(0..num_rounds),
            RoundBound::Inclusive => rng.gen_range(0..=num_rounds),
        })
        .collect();
    rounds.resize(num_nodes, num_rounds);
    rounds.shuffle(rng);
    rounds
}

/// Linear phases of a benchmark run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Clean,
    Sync,
    Prepare,
    Launch,
    Wait,
    Teardown,
    Collect,
}

/// How leftover workload processes were stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Nothing was left to kill.
    Graceful,
    /// At least one process had to be killed.
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostResult {
    Ok,
    // reported OK while assigned fewer rounds
    Evil,
    Failed,
    // no result file, or an unexpected one
    Missing(String),
}

impl fmt::Display for HostResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Evil => write!(f, "EVIL"),
            Self::Failed => write!(f, "FAILED"),
            Self::Missing(output) => write!(f, "MISSING({})", output),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Ok,
    Failed,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Everything needed to interpret the artifacts of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub num_nodes: usize,
    pub num_rounds: u64,
    pub propose_duration: f64,
    pub acknowledge_duration: f64,
    pub vote_duration: f64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub rounds_per_host: Vec<(String, u64)>,
    pub results: Vec<(String, HostResult)>,
    pub verdict: Option<Verdict>,
    pub data_dir: Option<PathBuf>,
}

impl RunRecord {
    fn rounds_of(&self, host: &str) -> Option<u64> {
        self.rounds_per_host
            .iter()
            .find(|(h, _)| h == host)
            .map(|(_, rounds)| *rounds)
    }

    /// `nodes;rounds;propose;ack;vote;start;end;"host,result,...";verdict`
    pub fn csv_line(&self) -> String {
        let results = self
            .results
            .iter()
            .map(|(host, result)| format!("{},{}", host, result))
            .collect::<Vec<_>>()
            .join(",");
        let verdict = self
            .verdict
            .map(|verdict| verdict.to_string())
            .unwrap_or_default();
        format!(
            "{};{};{};{};{};{};{};\"{}\";{}",
            self.num_nodes,
            self.num_rounds,
            self.propose_duration,
            self.acknowledge_duration,
            self.vote_duration,
            self.start.format(TIMESTAMP_FORMAT),
            self.end.format(TIMESTAMP_FORMAT),
            results,
            verdict
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadUpdate {
    // hosts that received at least one archive
    pub updated: Vec<String>,
    pub unpacked: Vec<String>,
}

/// Drives deployments and benchmark runs over a remote session bound to the
/// running part of the fleet.
pub struct Orchestrator {
    config: BenchConfig,
    session: Session,
    // processes started by the last benchmark launch
    processes: Vec<Box<dyn RemoteProcess>>,
    progress: TracingProgressBar,
}

impl Orchestrator {
    pub fn new(config: BenchConfig, shell: impl RemoteShell + 'static) -> Self {
        Self {
            config,
            session: Session::new(shell),
            processes: Vec::new(),
            progress: TracingProgressBar::hidden(),
        }
    }

    pub fn with_progress(mut self, progress: TracingProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn hosts(&self) -> &[String] {
        self.session.hosts()
    }

    /// Binds the session to the running instances and checks that every one
    /// of them answers. Without running instances this does nothing.
    pub async fn connect(&mut self, fleet: &Fleet) -> Result<Option<RunResult>, RemoteError> {
        let running = fleet.running();
        let hosts: Vec<(String, String)> = running
            .iter()
            .filter_map(|i| Some((i.dnsname()?.to_string(), i.id().clone())))
            .collect();
        if hosts.is_empty() {
            tracing::info!("no hosts to connect to");
            return Ok(None);
        }

        tracing::info!(
            "connecting to {} out of {} instance(s)...",
            hosts.len(),
            fleet.len()
        );
        self.session.bind(hosts);
        let result = self.session.run("date", &RunOptions::default()).await?;
        for outcome in &result.outcomes {
            tracing::info!(
                "connected to {}: {}",
                outcome.id.as_deref().unwrap_or(&outcome.host),
                outcome.stdout
            );
        }
        Ok(Some(result))
    }

    pub async fn run(
        &self,
        script: impl Into<Script>,
        options: &RunOptions,
    ) -> Result<RunResult, RemoteError> {
        self.session.run_script(&script.into(), options).await
    }

    /// Copies `local` to `remote_name` (relative to the remote home) on every
    /// host whose copy has a different digest or doesn't exist. Returns those
    /// hosts.
    pub async fn sync_file(
        &mut self,
        local: &Path,
        remote_name: &str,
    ) -> Result<Vec<String>, Report> {
        let digest = util::file_digest(local).await?;
        let remote = self.config.remote_path(remote_name);
        let check = format!("[ -f {0} ] && sha256sum {0} || echo \"\"", remote);
        let result = self
            .session
            .run(&check, &RunOptions::default())
            .await
            .wrap_err_with(|| format!("digest of {}", remote))?;

        let outdated: Vec<String> = self
            .session
            .hosts()
            .iter()
            .filter(|host| {
                let remote_digest = result
                    .outcome(host)
                    .and_then(|outcome| outcome.stdout.split_whitespace().next());
                remote_digest != Some(digest.as_str())
            })
            .cloned()
            .collect();

        if outdated.is_empty() {
            tracing::info!(
                "({}) {} already up to date on all instances",
                &digest[..12],
                remote_name
            );
            return Ok(outdated);
        }
        tracing::info!(
            "({}) updating {} on {} instance(s)...",
            &digest[..12],
            remote_name,
            outdated.len()
        );
        let narrowed = self.session.narrow(outdated.clone());
        narrowed
            .copy_to(local, &remote)
            .await
            .wrap_err_with(|| format!("copy {}", local.display()))?;
        Ok(outdated)
    }

    /// Refreshes the node list, packs the payload, syncs every archive and
    /// unpacks it where it changed (everywhere with `always_unpack`).
    pub async fn update_payload(
        &mut self,
        fleet: &Fleet,
        always_unpack: bool,
    ) -> Result<PayloadUpdate, Report> {
        let fleet_config = fleet.config();
        fleet
            .write_node_list(&fleet_config.node_list_path, fleet_config.node_list_port)
            .wrap_err("node list")?;

        if let Some(pack_script) = &self.config.pack_script {
            tracing::info!("packing payload...");
            let status = tokio::process::Command::new(pack_script)
                .stdout(std::process::Stdio::null())
                .status()
                .await
                .wrap_err_with(|| format!("run {}", pack_script.display()))?;
            if !status.success() {
                eyre::bail!("{} failed: {}", pack_script.display(), status);
            }
        }

        let mut updated = BTreeSet::new();
        for archive in self.config.archives.clone() {
            let local = self.config.payload_dir.join(&archive);
            updated.extend(self.sync_file(&local, &archive).await?);
        }

        // keep session order
        let unpacked: Vec<String> = self
            .session
            .hosts()
            .iter()
            .filter(|host| always_unpack || updated.contains(*host))
            .cloned()
            .collect();
        if unpacked.is_empty() {
            tracing::info!("all instances already on the newest version");
        } else {
            tracing::info!("unpacking on {} instance(s)...", unpacked.len());
            let unpack = self.unpack_command();
            let narrowed = self.session.narrow(unpacked.clone());
            narrowed
                .run(&unpack, &RunOptions::default())
                .await
                .wrap_err("unpack")?;
        }
        Ok(PayloadUpdate {
            updated: updated.into_iter().collect(),
            unpacked,
        })
    }

    fn unpack_command(&self) -> String {
        let mut steps = vec![
            format!("cd {}", self.config.remote_home),
            format!("rm -rf {}", self.config.workload_dir),
        ];
        steps.extend(
            self.config
                .archives
                .iter()
                .map(|archive| format!("unzip -o -q {}", archive)),
        );
        steps.join(" && ")
    }

    /// Closes tracked processes, waits, and then kills whatever is left.
    pub async fn cleanup(&mut self) -> Result<Shutdown, RemoteError> {
        if !self.processes.is_empty() {
            tracing::info!("stopping {} process(es) gracefully", self.processes.len());
            for process in self.processes.drain(..) {
                let host = process.host().to_string();
                if let Err(e) = process.close().await {
                    tracing::warn!("closing process on {} failed: {}", host, e);
                }
            }
            tokio::time::sleep(self.config.shutdown_grace()).await;
        }

        let result = self
            .session
            .run(&self.config.kill_command, &RunOptions::tolerant())
            .await?;
        // pkill exits with 0 only if it killed something
        let killed = result.outcomes.iter().any(|o| o.exit_code == Some(0));
        if killed {
            tracing::warn!("forcefully killed at least one running process");
            tokio::time::sleep(self.config.shutdown_grace()).await;
            Ok(Shutdown::Forced)
        } else {
            tracing::info!("graceful shutdown succeeded (or nothing was running)");
            Ok(Shutdown::Graceful)
        }
    }

    fn phase(&self, phase: Phase) {
        tracing::info!("phase {:?}", phase);
    }

    /// Runs one benchmark across all running instances and collects its
    /// results and logs.
    pub async fn run_benchmark(
        &mut self,
        fleet: &Fleet,
        params: &BenchParams,
    ) -> Result<RunRecord, Report> {
        self.phase(Phase::Connect);
        if self.connect(fleet).await?.is_none() {
            eyre::bail!("no running instances to run the benchmark on");
        }

        self.phase(Phase::Clean);
        self.cleanup().await?;

        if params.sync {
            self.phase(Phase::Sync);
            self.update_payload(fleet, false).await?;
        }

        let hosts = self.session.hosts().to_vec();
        if hosts.len() != params.num_nodes {
            eyre::bail!(
                "expected {} running instance(s), found {}",
                params.num_nodes,
                hosts.len()
            );
        }

        let schedule = Schedule::new(Utc::now(), params);
        let rounds = assign_rounds(
            params.num_nodes,
            params.num_rounds,
            params.adversary,
            &mut rand::thread_rng(),
        );
        let mut record = RunRecord {
            num_nodes: params.num_nodes,
            num_rounds: params.num_rounds,
            propose_duration: params.propose(),
            acknowledge_duration: params.acknowledge(),
            vote_duration: params.vote(),
            start: schedule.start,
            end: schedule.end,
            rounds_per_host: hosts.iter().cloned().zip(rounds.iter().copied()).collect(),
            results: Vec::new(),
            verdict: None,
            data_dir: None,
        };
        tracing::info!("starting protocol at:        {}", schedule.start);
        tracing::info!("protocol should complete at: {}", schedule.end);
        tracing::info!(
            "total duration:              {} min",
            schedule.total().num_minutes()
        );
        tracing::debug!("{:?}", record.rounds_per_host);

        self.phase(Phase::Prepare);
        let prepare = format!(
            "pkill -f {}; rm -f {}",
            self.config.monitor_pattern, self.config.stats_file
        );
        self.session.run(&prepare, &RunOptions::tolerant()).await?;

        self.phase(Phase::Launch);
        let launch = self.launch_command(params, &schedule);
        tracing::info!("{}", launch);
        let options = RunOptions {
            use_pty: true,
            host_args: Some(rounds.iter().map(|r| r.to_string()).collect()),
            ..RunOptions::default()
        };
        // handles that did start are tracked even if another host failed, so
        // that the next cleanup closes them
        self.session
            .spawn(&launch, &options, &mut self.processes)
            .await?;

        self.phase(Phase::Wait);
        tracing::info!("waiting for protocol run to complete...");
        tokio::time::sleep(schedule.remaining(Utc::now())).await;
        tracing::info!(
            "protocol run should be finished now, waiting {:?} more",
            self.config.post_run_grace()
        );
        tokio::time::sleep(self.config.post_run_grace()).await;

        self.phase(Phase::Teardown);
        let teardown = format!("pkill -f {}", self.config.monitor_pattern);
        if let Err(e) = self.session.run(&teardown, &RunOptions::tolerant()).await {
            tracing::warn!("stopping the monitor failed: {}", e);
        }

        self.phase(Phase::Collect);
        self.collect_results(&mut record).await?;
        self.collect_logs(&mut record).await?;
        Ok(record)
    }

    fn launch_command(&self, params: &BenchParams, schedule: &Schedule) -> String {
        let command = args![
            format!("{} &> /dev/null &", self.config.monitor_command),
            format!("cd {} &&", self.config.remote_path(&self.config.workload_dir)),
            self.config.workload_command,
            "--start-at",
            format!("'{}'", schedule.start.format(TIMESTAMP_FORMAT)),
            "--connection-lead-time",
            params.connection_lead_time,
            "--propose-duration",
            params.propose(),
            "--acknowledge-duration",
            params.acknowledge(),
            "--vote-duration",
            params.vote(),
            "--num-rounds",
            crate::remote::HOST_ARG,
            format!("> {} 2>&1", self.config.std_log),
        ];
        command.join(" ")
    }

    /// Reads every host's result, appends the run to the results csv and
    /// logs the verdict.
    pub async fn collect_results(&mut self, record: &mut RunRecord) -> Result<Verdict, Report> {
        tracing::info!("collecting results...");
        let command = format!("cat {}", self.config.result_file);
        let result = self.session.run(&command, &RunOptions::tolerant()).await?;

        let results: Vec<(String, HostResult)> = result
            .outcomes
            .iter()
            .map(|outcome| {
                let host_result = match (outcome.is_success(), outcome.stdout.trim()) {
                    (true, "OK") if record.rounds_of(&outcome.host) != Some(record.num_rounds) => {
                        HostResult::Evil
                    }
                    (true, "OK") => HostResult::Ok,
                    (true, "FAILED") => HostResult::Failed,
                    (_, output) => HostResult::Missing(output.to_string()),
                };
                (outcome.host.clone(), host_result)
            })
            .collect();
        record.results = results;

        let failed = record
            .results
            .iter()
            .filter(|(_, r)| matches!(r, HostResult::Failed | HostResult::Missing(_)))
            .count();
        let evil = record
            .results
            .iter()
            .filter(|(_, r)| r == &HostResult::Evil)
            .count();
        let ok = record.results.len() - failed;
        let verdict = if failed == 0 { Verdict::Ok } else { Verdict::Failed };
        record.verdict = Some(verdict);

        for (host, result) in &record.results {
            if matches!(result, HostResult::Failed | HostResult::Missing(_)) {
                tracing::warn!("{}: {}", host, result);
            }
        }
        tracing::info!("RESULT: {}", verdict);
        tracing::info!("OK returned by {} node(s) (out of which {} aborted)", ok, evil);
        tracing::info!("FAILED returned by {} node(s)", failed);

        util::append_line(&self.config.results_csv, &record.csv_line())
            .wrap_err_with(|| format!("append to {}", self.config.results_csv.display()))?;
        Ok(verdict)
    }

    /// Downloads the logs of a run into a directory named after its start,
    /// together with a `run.json` record.
    pub async fn collect_logs(&mut self, record: &mut RunRecord) -> Result<PathBuf, Report> {
        let name = record.start.format(RUN_DIR_FORMAT).to_string();
        let dir = self.download_logs(&name).await?;
        record.data_dir = Some(dir.clone());
        let json = serde_json::to_string_pretty(record).wrap_err("serialize run record")?;
        std::fs::write(dir.join(RUN_RECORD), json).wrap_err("write run record")?;
        Ok(dir)
    }

    /// Downloads every log file from every host into `<data dir>/<name>`.
    pub async fn download_logs(&self, name: &str) -> Result<PathBuf, Report> {
        let dir = self.config.data_dir.join(name);
        std::fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("create {}", dir.display()))?;

        self.progress.set_length(self.config.log_files.len() as u64);
        for remote in &self.config.log_files {
            tracing::info!(
                "downloading {} from {} host(s)",
                remote,
                self.session.hosts().len()
            );
            self.session
                .copy_from(remote, &dir)
                .await
                .wrap_err_with(|| format!("download {}", remote))?;
            self.progress.inc();
        }
        self.progress.finish();
        Ok(dir)
    }
}
