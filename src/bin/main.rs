use clap::{Parser, Subcommand};
use color_eyre::eyre::{self, WrapErr};
use color_eyre::Report;
use fleet_exp::bench::{BenchParams, Orchestrator, RoundBound};
use fleet_exp::events::TracingSink;
use fleet_exp::fleet::Launch;
use fleet_exp::gateway::aws::AwsEc2;
use fleet_exp::gateway::Gateway;
use fleet_exp::probe::TcpProbe;
use fleet_exp::progress::{self, TracingProgressBar};
use fleet_exp::prompt::{AssumeYes, Confirmation, Terminal};
use fleet_exp::remote::ssh::SshShell;
use fleet_exp::remote::RunOptions;
use fleet_exp::{ExperimentConfig, Fleet, RegionPlan, Target};
use std::path::PathBuf;

// nodes of a benchmark when not given
const NUM_NODES: usize = 5;

/// Manage an EC2 fleet across regions and run benchmarks on it.
#[derive(Debug, Parser)]
#[command(name = "fleet_exp", arg_required_else_help = true)]
struct Cli {
    /// JSON configuration file; defaults apply to anything it leaves out.
    #[arg(long, value_name = "FILE", env = "FLEET_EXP_CONFIG")]
    config: Option<PathBuf>,
    /// Number of nodes the fleet should have.
    #[arg(long, default_value_t = NUM_NODES)]
    nodes: usize,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show every instance and the running count per region.
    Status,
    /// Launch instances until every region runs its share of `--nodes`.
    Create {
        #[arg(long)]
        dry_run: bool,
        /// Don't ask for confirmation.
        #[arg(long)]
        yes: bool,
    },
    Start(Transition),
    Stop(Transition),
    Reboot(Transition),
    Terminate(Transition),
    /// Wait until pending and running instances are reachable.
    Wait,
    /// Check that every running instance answers over ssh.
    Connect,
    /// Sync the payload archives and unpack them where they changed.
    Deploy {
        #[arg(long)]
        always_unpack: bool,
    },
    /// Run one benchmark on all running instances.
    Bench(Bench),
    /// Run a shell command on all running instances.
    Run {
        command: String,
        /// Report failures instead of aborting.
        #[arg(long)]
        no_raise: bool,
    },
    /// Download every log file into `<data dir>/<tag>`.
    Collect {
        #[arg(long)]
        tag: String,
    },
    /// Re-create the security group in every region.
    SecurityGroups,
    /// Stop whatever workload is still running.
    Kill,
}

#[derive(Debug, clap::Args)]
struct Transition {
    /// Instance ids; defaults to every instance in the right state.
    ids: Vec<String>,
    #[arg(long)]
    dry_run: bool,
}

impl Transition {
    fn target(&self) -> Option<Target> {
        if self.ids.is_empty() {
            None
        } else {
            Some(Target::Ids(self.ids.clone()))
        }
    }
}

#[derive(Debug, clap::Args)]
struct Bench {
    #[arg(long)]
    rounds: u64,
    /// Duration of each round phase, in seconds.
    #[arg(long, default_value_t = 2.0)]
    duration: f64,
    #[arg(long)]
    propose: Option<f64>,
    #[arg(long)]
    acknowledge: Option<f64>,
    #[arg(long)]
    vote: Option<f64>,
    /// Seconds between now and the start of the protocol.
    #[arg(long, default_value_t = 60)]
    startup_delay: u64,
    #[arg(long, default_value_t = 20)]
    connection_lead_time: u64,
    /// Let a minority of nodes stop early.
    #[arg(long)]
    adversary: bool,
    /// Adversaries may also run every round.
    #[arg(long, requires = "adversary")]
    inclusive_adversary_bound: bool,
    /// Skip the payload sync.
    #[arg(long)]
    no_sync: bool,
}

impl Bench {
    fn params(&self, num_nodes: usize) -> BenchParams {
        let adversary = match (self.adversary, self.inclusive_adversary_bound) {
            (false, _) => None,
            (true, false) => Some(RoundBound::Exclusive),
            (true, true) => Some(RoundBound::Inclusive),
        };
        BenchParams {
            num_nodes,
            num_rounds: self.rounds,
            duration: self.duration,
            propose_duration: self.propose,
            acknowledge_duration: self.acknowledge,
            vote_duration: self.vote,
            startup_delay: self.startup_delay,
            connection_lead_time: self.connection_lead_time,
            adversary,
            sync: !self.no_sync,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Report> {
    color_eyre::install()?;
    let cli = Cli::parse();

    // long transfers get a progress bar that also carries the logs
    let progress = match &cli.command {
        Command::Bench(_) | Command::Collect { .. } => TracingProgressBar::init(0),
        _ => {
            progress::init_tracing();
            TracingProgressBar::hidden()
        }
    };

    let config = ExperimentConfig::load(cli.config.as_deref())?;
    let ec2 = AwsEc2::new(&config.fleet.regions)?;
    let mut fleet = Fleet::new(
        config.fleet.clone(),
        Gateway::new(ec2),
        TcpProbe,
        TracingSink,
    );
    fleet
        .refresh(&Target::All)
        .await
        .wrap_err("initial refresh")?;
    let mut orchestrator =
        Orchestrator::new(config.bench.clone(), SshShell::new(config.ssh.clone()))
            .with_progress(progress);

    match cli.command {
        Command::Status => {
            let report = fleet.status().await?;
            print!("{}", report);
        }
        Command::Create { dry_run, yes } => {
            let plan = RegionPlan::distribute(cli.nodes, &config.fleet.regions);
            let confirmation: Box<dyn Confirmation> = if yes {
                Box::new(AssumeYes)
            } else {
                Box::new(Terminal)
            };
            match fleet.create(&plan, confirmation.as_ref(), dry_run).await? {
                Launch::Aborted => tracing::info!("launch aborted"),
                Launch::Launched(launched) => {
                    tracing::info!("launched {} instance(s): {}", launched.len(), launched)
                }
            }
        }
        Command::Start(args) => {
            let started = fleet.start(args.target(), args.dry_run).await?;
            tracing::info!("started {}", started);
        }
        Command::Stop(args) => {
            let stopped = fleet.stop(args.target(), args.dry_run).await?;
            tracing::info!("stopped {}", stopped);
        }
        Command::Reboot(args) => {
            let rebooted = fleet.reboot(args.target(), args.dry_run).await?;
            tracing::info!("rebooted {}", rebooted);
        }
        Command::Terminate(args) => {
            let terminated = fleet.terminate(args.target(), args.dry_run).await?;
            tracing::info!("terminated {}", terminated);
        }
        Command::Wait => {
            let ready = fleet.wait_for_startup(None).await?;
            tracing::info!("{} instance(s) reachable", ready.len());
        }
        Command::Connect => {
            orchestrator.connect(&fleet).await?;
        }
        Command::Deploy { always_unpack } => {
            connected(&mut orchestrator, &fleet).await?;
            let update = orchestrator.update_payload(&fleet, always_unpack).await?;
            tracing::info!(
                "updated {} instance(s), unpacked on {}",
                update.updated.len(),
                update.unpacked.len()
            );
        }
        Command::Bench(bench) => {
            let params = bench.params(cli.nodes);
            let record = orchestrator.run_benchmark(&fleet, &params).await?;
            if let Some(dir) = &record.data_dir {
                tracing::info!("run stored in {}", dir.display());
            }
        }
        Command::Run { command, no_raise } => {
            connected(&mut orchestrator, &fleet).await?;
            let options = if no_raise {
                RunOptions::tolerant()
            } else {
                RunOptions::default()
            };
            let result = orchestrator.run(command, &options).await?;
            for outcome in &result.outcomes {
                println!("{}", outcome);
            }
        }
        Command::Collect { tag } => {
            connected(&mut orchestrator, &fleet).await?;
            let dir = orchestrator.download_logs(&tag).await?;
            tracing::info!("logs stored in {}", dir.display());
        }
        Command::SecurityGroups => {
            fleet.recreate_security_groups().await?;
        }
        Command::Kill => {
            connected(&mut orchestrator, &fleet).await?;
            let shutdown = orchestrator.cleanup().await?;
            tracing::info!("{:?}", shutdown);
        }
    }
    Ok(())
}

async fn connected(orchestrator: &mut Orchestrator, fleet: &Fleet) -> Result<(), Report> {
    if orchestrator.connect(fleet).await?.is_none() {
        eyre::bail!("no running instances");
    }
    Ok(())
}
