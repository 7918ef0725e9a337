use crate::regions::{self, Region};
use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// fleet defaults
const REFRESH_INTERVAL_MS: u64 = 5000;
const PROBE_PORT: u16 = 22;
const INSTANCE_TYPE: &str = "t2.micro";
const KEY_NAME: &str = "hydrand";
const SECURITY_GROUP: &str = "hydrand";
const SECURITY_GROUP_DESCRIPTION: &str = "hydrand security group (script generated)";
const IMAGE_OWNER: &str = "amazon";
const IMAGE_NAME_PATTERN: &str = "amzn2-ami-hvm-2.0.????????-x86_64-gp2";
const BOOTSTRAP_SCRIPT: &str = "aws/setup-instance.sh";
const SHUTDOWN_BEHAVIOR: &str = "terminate";
const SSH_PORT: u16 = 22;
const NODE_PORT: u16 = 8333;
const NODE_LIST_PATH: &str = "aws/nodes.txt";

// ssh defaults
const SSH_USER: &str = "ec2-user";
const SSH_PRIVATE_KEY: &str = "~/.ssh/hydrand.pem";
const SSH_KEEPALIVE_SECS: u64 = 30;

// benchmark defaults
const PAYLOAD_DIR: &str = "aws";
const PACK_SCRIPT: &str = "aws/pack.sh";
const ARCHIVES: [&str; 2] = ["hydrand-base.zip", "hydrand.zip"];
const REMOTE_HOME: &str = "/home/ec2-user";
const WORKLOAD_DIR: &str = "hydrand.py";
const WORKLOAD_COMMAND: &str = "python3 -m hydrand --sync-mode";
const MONITOR_COMMAND: &str = "dstat --integer --noupdate -T -n --tcp --cpu --mem --output ~/stats.log 1";
const MONITOR_PATTERN: &str = "dstat";
const STATS_FILE: &str = "~/stats.log";
const KILL_COMMAND: &str = "pkill -9 python3";
const STD_LOG: &str = "/home/ec2-user/std.log";
const RESULT_FILE: &str = "~/hydrand.py/output/result";
const LOG_FILES: [&str; 3] = [
    "/home/ec2-user/std.log",
    "/home/ec2-user/stats.log",
    "/home/ec2-user/hydrand.py/output/node.log",
];
const DATA_DIR: &str = "data";
const RESULTS_CSV: &str = "data/results.csv";
// wait after closing tracked processes, and after a forced kill
const SHUTDOWN_GRACE_SECS: u64 = 5;
// wait after the expected end of a run before tearing down
const POST_RUN_GRACE_SECS: u64 = 10;

/// Everything a run needs, constructed once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub fleet: FleetConfig,
    pub ssh: SshConfig,
    pub bench: BenchConfig,
}

impl ExperimentConfig {
    /// Loads the configuration from a json file. Missing fields (or a missing
    /// `path`) take their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, Report> {
        let path = match path {
            Some(path) => path,
            None => return Ok(Self::default()),
        };
        let json = std::fs::read_to_string(path).wrap_err_with(|| {
            format!("read config file {}", path.display())
        })?;
        let config = serde_json::from_str(&json).wrap_err_with(|| {
            format!("parse config file {}", path.display())
        })?;
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub regions: Vec<Region>,
    pub refresh_interval_ms: u64,
    pub probe_port: u16,
    // defaults to the refresh interval
    pub probe_timeout_ms: Option<u64>,
    // `None` waits forever
    pub convergence_timeout_secs: Option<u64>,
    pub instance_type: String,
    pub key_name: String,
    pub security_group: String,
    pub security_group_description: String,
    pub image_owner: String,
    pub image_name_pattern: String,
    // passed as user data on launch; `None` launches without user data
    pub bootstrap_script: Option<PathBuf>,
    pub shutdown_behavior: String,
    pub ingress_ports: Vec<u16>,
    pub node_list_path: PathBuf,
    pub node_list_port: u16,
}

impl FleetConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(
            self.probe_timeout_ms.unwrap_or(self.refresh_interval_ms),
        )
    }

    pub fn convergence_timeout(&self) -> Option<Duration> {
        self.convergence_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            regions: regions::default_regions(),
            refresh_interval_ms: REFRESH_INTERVAL_MS,
            probe_port: PROBE_PORT,
            probe_timeout_ms: None,
            convergence_timeout_secs: None,
            instance_type: INSTANCE_TYPE.to_string(),
            key_name: KEY_NAME.to_string(),
            security_group: SECURITY_GROUP.to_string(),
            security_group_description: SECURITY_GROUP_DESCRIPTION.to_string(),
            image_owner: IMAGE_OWNER.to_string(),
            image_name_pattern: IMAGE_NAME_PATTERN.to_string(),
            bootstrap_script: Some(PathBuf::from(BOOTSTRAP_SCRIPT)),
            shutdown_behavior: SHUTDOWN_BEHAVIOR.to_string(),
            ingress_ports: vec![SSH_PORT, NODE_PORT],
            node_list_path: PathBuf::from(NODE_LIST_PATH),
            node_list_port: NODE_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    pub private_key: PathBuf,
    pub keepalive_secs: u64,
    pub ssh_binary: String,
    pub scp_binary: String,
    // where multiplexed connections keep their control sockets; defaults to
    // the system temp dir
    pub control_dir: Option<PathBuf>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: SSH_USER.to_string(),
            private_key: PathBuf::from(SSH_PRIVATE_KEY),
            keepalive_secs: SSH_KEEPALIVE_SECS,
            ssh_binary: String::from("ssh"),
            scp_binary: String::from("scp"),
            control_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub payload_dir: PathBuf,
    // builds the archives; skipped when `None`
    pub pack_script: Option<PathBuf>,
    pub archives: Vec<String>,
    pub remote_home: String,
    pub workload_dir: String,
    pub workload_command: String,
    pub monitor_command: String,
    pub monitor_pattern: String,
    pub stats_file: String,
    pub kill_command: String,
    pub std_log: String,
    pub result_file: String,
    pub log_files: Vec<String>,
    pub data_dir: PathBuf,
    pub results_csv: PathBuf,
    pub shutdown_grace_secs: u64,
    pub post_run_grace_secs: u64,
}

impl BenchConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn post_run_grace(&self) -> Duration {
        Duration::from_secs(self.post_run_grace_secs)
    }

    pub fn remote_path(&self, file: &str) -> String {
        format!("{}/{}", self.remote_home.trim_end_matches('/'), file)
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            payload_dir: PathBuf::from(PAYLOAD_DIR),
            pack_script: Some(PathBuf::from(PACK_SCRIPT)),
            archives: ARCHIVES.iter().map(|s| s.to_string()).collect(),
            remote_home: REMOTE_HOME.to_string(),
            workload_dir: WORKLOAD_DIR.to_string(),
            workload_command: WORKLOAD_COMMAND.to_string(),
            monitor_command: MONITOR_COMMAND.to_string(),
            monitor_pattern: MONITOR_PATTERN.to_string(),
            stats_file: STATS_FILE.to_string(),
            kill_command: KILL_COMMAND.to_string(),
            std_log: STD_LOG.to_string(),
            result_file: RESULT_FILE.to_string(),
            log_files: LOG_FILES.iter().map(|s| s.to_string()).collect(),
            data_dir: PathBuf::from(DATA_DIR),
            results_csv: PathBuf::from(RESULTS_CSV),
            shutdown_grace_secs: SHUTDOWN_GRACE_SECS,
            post_run_grace_secs: POST_RUN_GRACE_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = ExperimentConfig::load(None).unwrap();
        assert_eq!(config.fleet.regions.len(), 8);
        assert_eq!(config.fleet.refresh_interval(), Duration::from_secs(5));
        // probe timeout follows the refresh interval unless set
        assert_eq!(config.fleet.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.fleet.convergence_timeout(), None);
        assert_eq!(config.fleet.ingress_ports, vec![22, 8333]);
        assert_eq!(config.ssh.user, "ec2-user");
        assert_eq!(
            config.bench.remote_path("hydrand.zip"),
            "/home/ec2-user/hydrand.zip"
        );
    }

    #[test]
    fn partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "fleet": {{
                    "regions": ["eu-west-1", "us-east-1"],
                    "convergence_timeout_secs": 600
                }},
                "ssh": {{ "user": "ubuntu" }}
            }}"#
        )
        .unwrap();

        let config = ExperimentConfig::load(Some(file.path())).unwrap();
        assert_eq!(
            config.fleet.regions,
            vec![Region::new("eu-west-1"), Region::new("us-east-1")]
        );
        assert_eq!(
            config.fleet.convergence_timeout(),
            Some(Duration::from_secs(600))
        );
        assert_eq!(config.fleet.instance_type, "t2.micro");
        assert_eq!(config.ssh.user, "ubuntu");
        assert_eq!(config.ssh.keepalive_secs, 30);
        assert_eq!(config.bench, BenchConfig::default());
    }

    #[test]
    fn bad_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(ExperimentConfig::load(Some(file.path())).is_err());
        assert!(ExperimentConfig::load(Some(Path::new("/does/not/exist"))).is_err());
    }
}
