use super::{Output, RemoteProcess, RemoteShell, TransportError};
use crate::config::SshConfig;
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

// ssh reserves this exit code for its own errors
const SSH_ERROR: i32 = 255;
// how long an idle master connection stays around
const CONTROL_PERSIST: &str = "10m";

/// `RemoteShell` driving the system `ssh` and `scp` binaries. Connections to
/// the same host are multiplexed over a single master connection.
pub struct SshShell {
    config: SshConfig,
    private_key: PathBuf,
    control_dir: PathBuf,
}

impl SshShell {
    pub fn new(config: SshConfig) -> Self {
        let private_key = expand_home(&config.private_key);
        let control_dir = config
            .control_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        Self {
            config,
            private_key,
            control_dir,
        }
    }

    fn options(&self) -> Vec<String> {
        let control_path = self.control_dir.join("fleet_exp-%C");
        vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ServerAliveInterval={}", self.config.keepalive_secs),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", control_path.display()),
            "-o".to_string(),
            format!("ControlPersist={}", CONTROL_PERSIST),
            "-i".to_string(),
            self.private_key.display().to_string(),
        ]
    }

    fn destination(&self, host: &str) -> String {
        format!("{}@{}", self.config.user, host)
    }

    fn ssh(&self, host: &str, command: &str, pty: bool) -> Command {
        let mut ssh = Command::new(&self.config.ssh_binary);
        ssh.args(self.options())
            .arg(if pty { "-tt" } else { "-T" })
            .arg(self.destination(host))
            .arg(command)
            .stdin(Stdio::null());
        tracing::debug!("{:?}", ssh);
        ssh
    }

    fn scp(&self, from: &str, to: &str) -> Command {
        let mut scp = Command::new(&self.config.scp_binary);
        scp.args(self.options())
            .arg("-q")
            .arg(from)
            .arg(to)
            .stdin(Stdio::null());
        tracing::debug!("{:?}", scp);
        scp
    }

    async fn copy(&self, mut scp: Command) -> Result<(), TransportError> {
        let program = self.config.scp_binary.clone();
        let output = scp.output().await.map_err(|source| TransportError::Spawn {
            program: program.clone(),
            source,
        })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(TransportError::Exit {
                program,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl RemoteShell for SshShell {
    fn exec<'a>(
        &'a self,
        host: &'a str,
        command: &'a str,
        pty: bool,
    ) -> BoxFuture<'a, Result<Output, TransportError>> {
        Box::pin(async move {
            let output = self
                .ssh(host, command, pty)
                .output()
                .await
                .map_err(|source| TransportError::Spawn {
                    program: self.config.ssh_binary.clone(),
                    source,
                })?;
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if output.status.code() == Some(SSH_ERROR) {
                return Err(TransportError::Unreachable {
                    host: host.to_string(),
                    message: stderr,
                });
            }
            Ok(Output {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
                stderr,
            })
        })
    }

    fn spawn<'a>(
        &'a self,
        host: &'a str,
        command: &'a str,
        pty: bool,
    ) -> BoxFuture<'a, Result<Box<dyn RemoteProcess>, TransportError>> {
        Box::pin(async move {
            let child = self
                .ssh(host, command, pty)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                // a dropped handle must not leave the local client running
                .kill_on_drop(true)
                .spawn()
                .map_err(|source| TransportError::Spawn {
                    program: self.config.ssh_binary.clone(),
                    source,
                })?;
            let process: Box<dyn RemoteProcess> = Box::new(SshProcess {
                host: host.to_string(),
                child,
            });
            Ok(process)
        })
    }

    fn copy_to<'a>(
        &'a self,
        host: &'a str,
        local: &'a Path,
        remote: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let to = format!("{}:{}", self.destination(host), remote);
            let scp = self.scp(&local.display().to_string(), &to);
            self.copy(scp).await
        })
    }

    fn copy_from<'a>(
        &'a self,
        host: &'a str,
        remote: &'a str,
        local: &'a Path,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let from = format!("{}:{}", self.destination(host), remote);
            let scp = self.scp(&from, &local.display().to_string());
            self.copy(scp).await
        })
    }
}

/// Local `ssh` client of a spawned remote command.
struct SshProcess {
    host: String,
    child: Child,
}

impl RemoteProcess for SshProcess {
    fn host(&self) -> &str {
        &self.host
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>> {
        let SshProcess { host, mut child } = *self;
        Box::pin(async move {
            // with a pty, dropping the client hangs up the remote process
            if child.try_wait()?.is_none() {
                child.kill().await?;
            }
            tracing::debug!("closed channel to {}", host);
            Ok(())
        })
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}
