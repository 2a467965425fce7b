//! SSH capability used to provision remote agents
//!
//! [`SystemSsh`] drives the system `ssh` client through `tokio::process`.
//! Password authentication goes through `sshpass -e`, which reads the
//! password from the `SSHPASS` environment variable so it never shows up in
//! the process list.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshAuth {
    Password(String),
    /// Private key file on the hub
    KeyFile(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SshAuth,
}

/// Receives every line of a remote command's combined output
pub type OutputSink<'a> = &'a mut (dyn FnMut(&str) + Send);

#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn SshSession>>;
}

#[async_trait]
pub trait SshSession: Send {
    /// Run `command` remotely until it exits, returning its exit code
    async fn run(&mut self, command: &str, output: OutputSink<'_>) -> Result<i32>;
}

#[derive(Debug, Clone)]
pub struct SystemSsh {
    ssh: String,
    sshpass: String,
}

impl Default for SystemSsh {
    fn default() -> Self {
        Self {
            ssh: "ssh".to_string(),
            sshpass: "sshpass".to_string(),
        }
    }
}

impl SystemSsh {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SshConnector for SystemSsh {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn SshSession>> {
        if let SshAuth::KeyFile(path) = &target.auth {
            tokio::fs::metadata(path)
                .await
                .with_context(|| format!("ssh key file {} is missing", path.display()))?;
        }
        Ok(Box::new(SystemSshSession {
            ssh: self.ssh.clone(),
            sshpass: self.sshpass.clone(),
            target: target.clone(),
        }))
    }
}

struct SystemSshSession {
    ssh: String,
    sshpass: String,
    target: SshTarget,
}

impl SystemSshSession {
    fn command(&self, remote: &str) -> Command {
        let SshTarget {
            host,
            port,
            user,
            auth,
        } = &self.target;

        let mut command = match auth {
            SshAuth::Password(password) => {
                let mut command = Command::new(&self.sshpass);
                command.arg("-e").arg(&self.ssh).env("SSHPASS", password);
                command
            }
            SshAuth::KeyFile(path) => {
                let mut command = Command::new(&self.ssh);
                command.arg("-i").arg(path).args(["-o", "BatchMode=yes"]);
                command
            }
        };

        command
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "ServerAliveInterval=15"])
            .arg("-p")
            .arg(port.to_string())
            .arg(format!("{user}@{host}"))
            .arg(remote)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl SshSession for SystemSshSession {
    async fn run(&mut self, remote: &str, output: OutputSink<'_>) -> Result<i32> {
        trace!("{}@{}: {remote}", self.target.user, self.target.host);
        let mut child = self
            .command(remote)
            .spawn()
            .context("failed to start ssh client")?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            bail!("ssh client output is not captured");
        };
        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let (mut stdout_done, mut stderr_done) = (false, false);

        while !(stdout_done && stderr_done) {
            tokio::select! {
                line = stdout.next_line(), if !stdout_done => match line? {
                    Some(line) => output(&line),
                    None => stdout_done = true,
                },
                line = stderr.next_line(), if !stderr_done => match line? {
                    Some(line) => output(&line),
                    None => stderr_done = true,
                },
            }
        }

        let status = child.wait().await.context("failed to wait for ssh client")?;
        // killed by a signal
        Ok(status.code().unwrap_or(-1))
    }
}
