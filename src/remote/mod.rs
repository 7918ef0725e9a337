// This module contains the definition of `RemoteShell`, `Session` and the
// outcome types of a fan-out.

// This module contains the ssh/scp implementation of `RemoteShell`.
pub mod ssh;

use crate::instance::InstanceId;
use futures::future::BoxFuture;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// replaced by the per-host argument when `RunOptions::host_args` is set
pub const HOST_ARG: &str = "{}";

/// Result of a command that ran on a host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    // `None` if the command was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{host} unreachable: {message}")]
    Unreachable { host: String, message: String },
    #[error("{program} exited with {code:?}: {stderr}")]
    Exit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Host-addressed command and copy service.
pub trait RemoteShell: Send + Sync {
    fn exec<'a>(
        &'a self,
        host: &'a str,
        command: &'a str,
        pty: bool,
    ) -> BoxFuture<'a, Result<Output, TransportError>>;

    /// Starts `command` without waiting for it to finish.
    fn spawn<'a>(
        &'a self,
        host: &'a str,
        command: &'a str,
        pty: bool,
    ) -> BoxFuture<'a, Result<Box<dyn RemoteProcess>, TransportError>>;

    fn copy_to<'a>(
        &'a self,
        host: &'a str,
        local: &'a Path,
        remote: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    fn copy_from<'a>(
        &'a self,
        host: &'a str,
        remote: &'a str,
        local: &'a Path,
    ) -> BoxFuture<'a, Result<(), TransportError>>;
}

/// Handle to a command started with `RemoteShell::spawn`.
pub trait RemoteProcess: Send {
    fn host(&self) -> &str;

    /// Closes the channel, which hangs up the remote process.
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>>;
}

/// One command, or several run one after the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    Single(String),
    Sequence(Vec<String>),
}

impl From<&str> for Script {
    fn from(command: &str) -> Self {
        Self::Single(command.to_string())
    }
}

impl From<String> for Script {
    fn from(command: String) -> Self {
        Self::Single(command)
    }
}

impl From<Vec<String>> for Script {
    fn from(commands: Vec<String>) -> Self {
        Self::Sequence(commands)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub sudo: bool,
    // run as this user (implies sudo)
    pub user: Option<String>,
    // fail right away on a transport error instead of reporting it per host
    pub stop_on_errors: bool,
    pub use_pty: bool,
    // one argument per bound host, in host order, substituted for `HOST_ARG`
    pub host_args: Option<Vec<String>>,
    // per host
    pub timeout: Option<Duration>,
    // whole fan-out
    pub dispatch_timeout: Option<Duration>,
    pub raise_on_failure: bool,
}

impl RunOptions {
    /// Options for commands whose failure is expected and inspected by the
    /// caller.
    pub fn tolerant() -> Self {
        Self {
            stop_on_errors: false,
            raise_on_failure: false,
            ..Self::default()
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            sudo: false,
            user: None,
            stop_on_errors: true,
            use_pty: false,
            host_args: None,
            timeout: None,
            dispatch_timeout: None,
            raise_on_failure: true,
        }
    }
}

#[derive(Debug)]
pub struct RemoteCommandOutcome {
    pub host: String,
    pub id: Option<InstanceId>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    // set if the command could not be run at all
    pub error: Option<TransportError>,
}

impl RemoteCommandOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }
}

impl fmt::Display for RemoteCommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let who = self.id.as_deref().unwrap_or(&self.host);
        match (&self.error, self.exit_code) {
            (Some(error), _) => write!(f, "{}: ERROR({})", who, error),
            (None, Some(0)) => write!(f, "{}: {}", who, self.stdout),
            (None, code) => {
                write!(f, "{}: ERROR({:?}): {}", who, code, self.stderr)
            }
        }
    }
}

/// Every outcome of one fan-out.
#[derive(Debug)]
pub struct RunResult {
    pub command: String,
    pub outcomes: Vec<RemoteCommandOutcome>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(RemoteCommandOutcome::is_success)
    }

    pub fn outcome(&self, host: &str) -> Option<&RemoteCommandOutcome> {
        self.outcomes.iter().find(|outcome| outcome.host == host)
    }

    pub fn failures(&self) -> impl Iterator<Item = &RemoteCommandOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.is_success())
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("not connected to any host")]
    NotConnected,
    #[error("{args} host argument(s) given for {hosts} host(s)")]
    HostArgs { hosts: usize, args: usize },
    #[error("execution of command '{command}' failed for at least one instance:\n{}", render_failures(.outcomes))]
    CommandFailed {
        command: String,
        outcomes: Vec<RemoteCommandOutcome>,
    },
    #[error("{host}: {source}")]
    Transport {
        host: String,
        source: TransportError,
    },
    #[error("fan-out did not complete within {0:?}")]
    DispatchTimeout(Duration),
    #[error("copy to/from {host} failed: {source}")]
    Copy {
        host: String,
        source: TransportError,
    },
}

fn render_failures(outcomes: &[RemoteCommandOutcome]) -> String {
    outcomes
        .iter()
        .filter(|outcome| !outcome.is_success())
        .map(|outcome| format!("    {}", outcome))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remote shell bound to a mutable list of hosts.
pub struct Session {
    shell: Box<dyn RemoteShell>,
    hosts: Vec<String>,
    ids: HashMap<String, InstanceId>,
}

impl Session {
    pub fn new(shell: impl RemoteShell + 'static) -> Self {
        Self {
            shell: Box::new(shell),
            hosts: Vec::new(),
            ids: HashMap::new(),
        }
    }

    /// Re-targets the session to `hosts` (address and instance id).
    pub fn bind(&mut self, hosts: Vec<(String, InstanceId)>) {
        self.hosts = hosts.iter().map(|(host, _)| host.clone()).collect();
        self.ids = hosts.into_iter().collect();
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn id(&self, host: &str) -> Option<&InstanceId> {
        self.ids.get(host)
    }

    /// Binds `hosts` until the returned guard is dropped, at which point the
    /// previous host list is restored.
    pub fn narrow(&mut self, hosts: Vec<String>) -> Narrowed<'_> {
        let previous = std::mem::replace(&mut self.hosts, hosts);
        Narrowed {
            session: self,
            previous,
        }
    }

    /// Runs every command of `script` in order on all bound hosts. Only the
    /// result of the last one is returned.
    pub async fn run_script(
        &self,
        script: &Script,
        options: &RunOptions,
    ) -> Result<RunResult, RemoteError> {
        match script {
            Script::Single(command) => self.run(command, options).await,
            Script::Sequence(commands) => {
                let mut last = RunResult {
                    command: String::new(),
                    outcomes: Vec::new(),
                };
                for command in commands {
                    last = self.run(command, options).await?;
                }
                Ok(last)
            }
        }
    }

    /// Runs `command` on all bound hosts in parallel and waits for every one
    /// of them.
    pub async fn run(
        &self,
        command: &str,
        options: &RunOptions,
    ) -> Result<RunResult, RemoteError> {
        let commands = self.commands(command, options)?;
        let fanout = futures::future::join_all(
            commands
                .iter()
                .map(|(host, command)| self.exec(host, command, options)),
        );
        let mut outcomes = match options.dispatch_timeout {
            Some(limit) => tokio::time::timeout(limit, fanout)
                .await
                .map_err(|_| RemoteError::DispatchTimeout(limit))?,
            None => fanout.await,
        };

        if options.stop_on_errors {
            if let Some(index) = outcomes.iter().position(|o| o.error.is_some()) {
                let outcome = outcomes.swap_remove(index);
                if let Some(source) = outcome.error {
                    return Err(RemoteError::Transport {
                        host: outcome.host,
                        source,
                    });
                }
            }
        }

        let result = RunResult {
            command: command.to_string(),
            outcomes,
        };
        if options.raise_on_failure && !result.is_success() {
            for outcome in &result.outcomes {
                tracing::warn!("{}", outcome);
            }
            return Err(RemoteError::CommandFailed {
                command: result.command,
                outcomes: result.outcomes,
            });
        }
        Ok(result)
    }

    async fn exec(
        &self,
        host: &str,
        command: &str,
        options: &RunOptions,
    ) -> RemoteCommandOutcome {
        let exec = self.shell.exec(host, command, options.use_pty);
        let result = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, exec)
                .await
                .unwrap_or(Err(TransportError::Timeout(limit))),
            None => exec.await,
        };
        let id = self.ids.get(host).cloned();
        match result {
            Ok(output) => RemoteCommandOutcome {
                host: host.to_string(),
                id,
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
                error: None,
            },
            Err(error) => RemoteCommandOutcome {
                host: host.to_string(),
                id,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                error: Some(error),
            },
        }
    }

    /// Starts `command` on all bound hosts. Every handle that was started is
    /// appended to `processes`, even when another host failed to start.
    pub async fn spawn(
        &self,
        command: &str,
        options: &RunOptions,
        processes: &mut Vec<Box<dyn RemoteProcess>>,
    ) -> Result<(), RemoteError> {
        let commands = self.commands(command, options)?;
        let spawned = futures::future::join_all(commands.iter().map(
            |(host, command)| async move {
                let result = self.shell.spawn(host, command, options.use_pty).await;
                (host, result)
            },
        ))
        .await;

        let mut failure = None;
        for (host, result) in spawned {
            match result {
                Ok(process) => processes.push(process),
                Err(source) => {
                    tracing::warn!("failed to start '{}' on {}: {}", command, host, source);
                    failure.get_or_insert(RemoteError::Transport {
                        host: host.clone(),
                        source,
                    });
                }
            }
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Copies `local` to `remote` on every bound host in parallel. Fails if
    /// any copy fails.
    pub async fn copy_to(
        &self,
        local: &Path,
        remote: &str,
    ) -> Result<(), RemoteError> {
        if self.hosts.is_empty() {
            return Err(RemoteError::NotConnected);
        }
        let copies = futures::future::join_all(self.hosts.iter().map(
            |host| async move { (host, self.shell.copy_to(host, local, remote).await) },
        ))
        .await;
        for (host, result) in copies {
            result.map_err(|source| RemoteError::Copy {
                host: host.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Copies `remote` from every bound host into `local_dir`, naming each
    /// copy `<host>_<file name>`. Returns the local paths.
    pub async fn copy_from(
        &self,
        remote: &str,
        local_dir: &Path,
    ) -> Result<Vec<PathBuf>, RemoteError> {
        if self.hosts.is_empty() {
            return Err(RemoteError::NotConnected);
        }
        let file_name = remote.rsplit('/').next().unwrap_or(remote);
        let targets: Vec<(&String, PathBuf)> = self
            .hosts
            .iter()
            .map(|host| (host, local_dir.join(format!("{}_{}", host, file_name))))
            .collect();
        let copies = futures::future::join_all(targets.iter().map(
            |(host, local)| async move {
                (*host, self.shell.copy_from(host, remote, local).await)
            },
        ))
        .await;
        for (host, result) in copies {
            result.map_err(|source| RemoteError::Copy {
                host: host.clone(),
                source,
            })?;
        }
        Ok(targets.into_iter().map(|(_, local)| local).collect())
    }

    // the command each bound host runs, after sudo wrapping and host argument
    // substitution
    fn commands(
        &self,
        command: &str,
        options: &RunOptions,
    ) -> Result<Vec<(String, String)>, RemoteError> {
        if self.hosts.is_empty() {
            return Err(RemoteError::NotConnected);
        }
        if let Some(args) = &options.host_args {
            if args.len() != self.hosts.len() {
                return Err(RemoteError::HostArgs {
                    hosts: self.hosts.len(),
                    args: args.len(),
                });
            }
        }
        let commands = self
            .hosts
            .iter()
            .enumerate()
            .map(|(index, host)| {
                let command = match &options.host_args {
                    Some(args) => command.replacen(HOST_ARG, &args[index], 1),
                    None => command.to_string(),
                };
                (host.clone(), elevate(command, options))
            })
            .collect();
        Ok(commands)
    }
}

fn elevate(command: String, options: &RunOptions) -> String {
    if !options.sudo && options.user.is_none() {
        return command;
    }
    let escaped = shell_escape::unix::escape(Cow::from(command));
    match &options.user {
        Some(user) => format!(
            "sudo -S -u {} bash -c {}",
            shell_escape::unix::escape(Cow::from(user.as_str())),
            escaped
        ),
        None => format!("sudo -S bash -c {}", escaped),
    }
}

/// Guard returned by [`Session::narrow`].
pub struct Narrowed<'a> {
    session: &'a mut Session,
    previous: Vec<String>,
}

impl Deref for Narrowed<'_> {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl DerefMut for Narrowed<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
    }
}

impl Drop for Narrowed<'_> {
    fn drop(&mut self) {
        self.session.hosts = std::mem::take(&mut self.previous);
    }
}
