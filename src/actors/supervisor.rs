//! Remote agent supervisor
//!
//! Each monitored file has an [`AgentSlot`] inside its client. The slot holds
//! at most one provisioning attempt and at most one inbound connection, each
//! with its own cancellation token, and derives the file's [`AgentPhase`]:
//!
//! ```text
//!            monitor tick                 agent connects
//! Absent ───────────────────► Provisioning ───────────────► Connected
//!   ▲                              │                            │
//!   └──────── provisioning ends ───┘                            │
//!   └──────────────────────── receive loop ends ────────────────┘
//! ```
//!
//! The provisioning attempt stays alive while connected because the remote
//! agent runs inside its SSH session.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::agent::AgentParams;
use crate::config::{Config, FileConfig};
use crate::ssh::{SshAuth, SshConnector, SshTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentPhase {
    Absent,
    Provisioning,
    Connected,
}

/// A provisioning attempt or a connection, identified so that a finishing
/// flow only clears its own registration
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: u64,
    pub token: CancellationToken,
}

#[derive(Debug, Default)]
pub struct AgentSlot {
    provision: Option<Registration>,
    connection: Option<Registration>,
}

impl AgentSlot {
    pub fn phase(&self) -> AgentPhase {
        match (&self.connection, &self.provision) {
            (Some(_), _) => AgentPhase::Connected,
            (None, Some(_)) => AgentPhase::Provisioning,
            (None, None) => AgentPhase::Absent,
        }
    }

    pub fn begin_provision(&mut self, registration: Registration) {
        if let Some(previous) = self.provision.replace(registration) {
            previous.token.cancel();
        }
    }

    /// Clear the attempt `id` if it is still the registered one
    pub fn end_provision(&mut self, id: u64) -> bool {
        match &self.provision {
            Some(attempt) if attempt.id == id => {
                attempt.token.cancel();
                self.provision = None;
                true
            }
            _ => false,
        }
    }

    /// Register `registration` as the active connection, cancelling the
    /// one it replaces
    pub fn connect(&mut self, registration: Registration) {
        if let Some(previous) = self.connection.replace(registration) {
            trace!("replacing connection {}", previous.id);
            previous.token.cancel();
        }
    }

    /// Clear the connection `id` if it is still the registered one. The
    /// provisioning attempt that produced it is torn down as well.
    pub fn disconnect(&mut self, id: u64) -> bool {
        match &self.connection {
            Some(connection) if connection.id == id => {
                connection.token.cancel();
                self.connection = None;
                if let Some(attempt) = self.provision.take() {
                    attempt.token.cancel();
                }
                true
            }
            _ => false,
        }
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.connection.as_ref().map(|connection| connection.id)
    }

    /// Cancel and forget both the connection and the attempt
    pub fn reset(&mut self) {
        for registration in [self.connection.take(), self.provision.take()]
            .into_iter()
            .flatten()
        {
            registration.token.cancel();
        }
    }
}

/// Everything needed to provision the agent of one file
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub client: String,
    pub file: FileConfig,
    /// `host:port` agents use to reach the hub
    pub endpoint: String,
    pub admin_user: String,
    pub admin_pwd: String,
    pub agent_binary: String,
    pub key_dir: PathBuf,
}

impl ProvisionRequest {
    pub fn new(config: &Config, client: &str, file: &FileConfig) -> Self {
        Self {
            client: client.to_string(),
            file: file.clone(),
            endpoint: config.public_endpoint(),
            admin_user: config.admin_user.clone(),
            admin_pwd: config.admin_pwd.clone(),
            agent_binary: config.agent_binary.clone(),
            key_dir: config.key_dir.clone(),
        }
    }

    pub fn key_file(&self) -> PathBuf {
        self.key_dir
            .join(format!("ssh_token_{}_{}", self.client, self.file.name))
    }

    pub fn download_command(&self) -> String {
        let agent = shell_quote(&self.agent_binary);
        format!(
            "curl -u {} -o {agent} {} && chmod +x {agent}",
            shell_quote(&format!("{}:{}", self.admin_user, self.admin_pwd)),
            shell_quote(&format!(
                "http://{}/static/{}",
                self.endpoint, self.agent_binary
            )),
        )
    }

    pub fn launch_command(&self) -> Result<String> {
        let params = AgentParams::for_file(
            &self.endpoint,
            &self.client,
            &self.file.name,
            &self.file.path,
        )?
        .encode()?;
        Ok(format!("./{} {params}", shell_quote(&self.agent_binary)))
    }
}

/// Single-quote `value` for a POSIX shell unless it is plainly safe
fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@=+".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// One-shot key file that is removed when the provisioning attempt ends,
/// however it ends.
struct KeyFile {
    path: PathBuf,
}

impl KeyFile {
    async fn write(path: PathBuf, key: &str) -> Result<Self> {
        let key_file = Self { path };
        write_key_file(&key_file.path, key).await?;
        Ok(key_file)
    }
}

impl Drop for KeyFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            debug!("failed to remove ssh key file {}: {e}", self.path.display());
        }
    }
}

async fn write_key_file(path: &Path, key: &str) -> Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(path)
        .await
        .with_context(|| format!("failed to create ssh key file {}", path.display()))?;
    tokio::io::AsyncWriteExt::write_all(&mut file, key.as_bytes())
        .await
        .context("failed to write ssh key file")?;
    Ok(())
}

/// Start the agent for `request.file` over SSH and keep it running until the
/// remote process exits or `token` is cancelled
#[instrument(skip_all, fields(client = %request.client, file = %request.file.name))]
pub async fn provision(
    request: ProvisionRequest,
    connector: Arc<dyn SshConnector>,
    token: CancellationToken,
) -> Result<()> {
    let file = &request.file;
    let (auth, _key_file) = if !file.ssh_pwd.is_empty() {
        (SshAuth::Password(file.ssh_pwd.clone()), None)
    } else {
        let key_file = KeyFile::write(request.key_file(), &file.ssh_key).await?;
        (SshAuth::KeyFile(key_file.path.clone()), Some(key_file))
    };
    let target = SshTarget {
        host: file.ssh_host.clone(),
        port: file.ssh_port,
        user: file.ssh_user.clone(),
        auth,
    };

    let download = request.download_command();
    let launch = request.launch_command()?;

    debug!("connecting to {}@{}:{}", target.user, target.host, target.port);
    let mut session = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        session = connector.connect(&target) => session.context("ssh connect failed")?,
    };

    let mut output = |line: &str| debug!("agent output: {line}");
    tokio::select! {
        _ = token.cancelled() => {
            debug!("provisioning cancelled");
            Ok(())
        }
        result = async {
            match session.run(&download, &mut output).await {
                Ok(0) => trace!("agent binary downloaded"),
                Ok(code) => debug!("agent download exited with {code}"),
                Err(e) => debug!("agent download failed: {e:#}"),
            }
            session.run(&launch, &mut output).await
        } => {
            let code = result.context("agent launch failed")?;
            debug!("agent exited with {code}");
            Ok(())
        }
    }
}
