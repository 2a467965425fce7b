use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::filter::script::{ScriptError, ScriptLoader};

/// Default history limit for a sub filter that does not configure `amount`
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Hub configuration, as persisted on disk and edited through the admin API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the hub binds to
    #[serde(default = "default_address")]
    pub address: String,

    /// Address agents use to reach the hub (defaults to `address`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Interval of the per-target agent monitor, in seconds
    #[serde(default = "default_reload_seconds")]
    pub reload_seconds: u64,

    /// Shared admin credential (admin API, static files, agent download)
    #[serde(default)]
    pub admin_user: String,
    #[serde(default)]
    pub admin_pwd: String,

    /// File name of the agent binary served under `/static/`
    #[serde(default = "default_agent_binary")]
    pub agent_binary: String,

    /// Directory served under `/static/`
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,

    /// Directory one-shot SSH key files are written to
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,

    #[serde(default)]
    pub targets: Vec<TargetConfig>,

    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub id: String,
    #[serde(default)]
    pub open: bool,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub files: Vec<FileConfig>,
}

/// A log file on a remote host, reached over SSH
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub ssh_host: String,
    #[serde(default)]
    pub ssh_port: u16,
    #[serde(default)]
    pub ssh_user: String,
    #[serde(default)]
    pub ssh_pwd: String,
    #[serde(default)]
    pub ssh_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub id: String,
    #[serde(default)]
    pub desc: String,
    /// Script source defining the check and summary functions
    #[serde(default)]
    pub script: String,
    /// Base predicate entry point
    pub check_function_name: String,
    #[serde(default)]
    pub sub_filters: Vec<SubFilterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubFilterConfig {
    pub id: String,
    #[serde(default)]
    pub desc: String,
    /// History limit; 0 selects [`DEFAULT_HISTORY_LIMIT`]
    #[serde(default)]
    pub amount: usize,
    pub check_function_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_function_name: Option<String>,
}

/// Reasons a candidate configuration is rejected
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("config unmarshal failed: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("target {0} is declared more than once")]
    DuplicateTarget(String),

    #[error("target {target} declares file {file} more than once")]
    DuplicateFile { target: String, file: String },

    #[error("target {target} file {file} needs a path")]
    MissingPath { target: String, file: String },

    #[error("target {target} file {file} needs ssh host, port, user and a key or password")]
    MissingSsh { target: String, file: String },

    #[error("target {target} references unknown filter {filter}")]
    UnknownFilter { target: String, filter: String },

    #[error("target {target} references filter {filter} more than once")]
    DuplicateFilterRef { target: String, filter: String },

    #[error("filter {0} is declared more than once")]
    DuplicateFilter(String),

    #[error("filter {filter} declares sub filter {sub_filter} more than once")]
    DuplicateSubFilter { filter: String, sub_filter: String },

    #[error("filter {0} has an empty script")]
    EmptyScript(String),

    #[error("filter {filter} script error: {source}")]
    Script {
        filter: String,
        #[source]
        source: ScriptError,
    },
}

fn default_address() -> String {
    String::from("127.0.0.1")
}

fn default_port() -> u16 {
    8080
}

fn default_reload_seconds() -> u64 {
    60
}

fn default_agent_binary() -> String {
    String::from("tailwatch-agent")
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("./static")
}

fn default_key_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: default_address(),
            public_address: None,
            port: default_port(),
            reload_seconds: default_reload_seconds(),
            admin_user: String::new(),
            admin_pwd: String::new(),
            agent_binary: default_agent_binary(),
            static_dir: default_static_dir(),
            key_dir: default_key_dir(),
            targets: Vec::new(),
            filters: Vec::new(),
        }
    }
}

impl Config {
    pub fn target(&self, id: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|target| target.id == id)
    }

    pub fn target_file(&self, id: &str, file: &str) -> Option<&FileConfig> {
        self.target(id)?.files.iter().find(|f| f.name == file)
    }

    pub fn filter(&self, id: &str) -> Option<&FilterConfig> {
        self.filters.iter().find(|filter| filter.id == id)
    }

    /// Interval between two agent monitor passes
    pub fn monitor_interval(&self) -> Duration {
        if self.reload_seconds == 0 {
            Duration::from_secs(default_reload_seconds())
        } else {
            Duration::from_secs(self.reload_seconds)
        }
    }

    /// `host:port` agents use to reach the hub
    pub fn public_endpoint(&self) -> String {
        let host = self.public_address.as_deref().unwrap_or(&self.address);
        format!("{host}:{}", self.port)
    }

    /// Check everything the hub relies on before a config becomes active.
    ///
    /// Scripts are loaded through `loader`, so a config is only accepted when
    /// every entry point it names resolves.
    pub fn validate(&self, loader: &dyn ScriptLoader) -> Result<(), ConfigError> {
        let mut target_ids = HashSet::new();
        for target in &self.targets {
            if !target_ids.insert(target.id.as_str()) {
                return Err(ConfigError::DuplicateTarget(target.id.clone()));
            }

            let mut file_names = HashSet::new();
            for file in &target.files {
                if !file_names.insert(file.name.as_str()) {
                    return Err(ConfigError::DuplicateFile {
                        target: target.id.clone(),
                        file: file.name.clone(),
                    });
                }
                if file.path.is_empty() {
                    return Err(ConfigError::MissingPath {
                        target: target.id.clone(),
                        file: file.name.clone(),
                    });
                }
                if file.ssh_host.is_empty()
                    || file.ssh_port == 0
                    || file.ssh_user.is_empty()
                    || (file.ssh_key.is_empty() && file.ssh_pwd.is_empty())
                {
                    return Err(ConfigError::MissingSsh {
                        target: target.id.clone(),
                        file: file.name.clone(),
                    });
                }
            }

            let mut filter_refs = HashSet::new();
            for filter_id in &target.filters {
                if !filter_refs.insert(filter_id.as_str()) {
                    return Err(ConfigError::DuplicateFilterRef {
                        target: target.id.clone(),
                        filter: filter_id.clone(),
                    });
                }
                if self.filter(filter_id).is_none() {
                    return Err(ConfigError::UnknownFilter {
                        target: target.id.clone(),
                        filter: filter_id.clone(),
                    });
                }
            }
        }

        let mut filter_ids = HashSet::new();
        for filter in &self.filters {
            if !filter_ids.insert(filter.id.as_str()) {
                return Err(ConfigError::DuplicateFilter(filter.id.clone()));
            }
            if filter.script.trim().is_empty() {
                return Err(ConfigError::EmptyScript(filter.id.clone()));
            }
            let mut sub_ids = HashSet::new();
            for sub in &filter.sub_filters {
                if !sub_ids.insert(sub.id.as_str()) {
                    return Err(ConfigError::DuplicateSubFilter {
                        filter: filter.id.clone(),
                        sub_filter: sub.id.clone(),
                    });
                }
            }

            let script_error = |source| ConfigError::Script {
                filter: filter.id.clone(),
                source,
            };
            let script = loader.load(&filter.id, &filter.script).map_err(script_error)?;
            script
                .predicate(&filter.check_function_name)
                .map_err(script_error)?;
            for sub in &filter.sub_filters {
                script
                    .predicate(&sub.check_function_name)
                    .map_err(script_error)?;
                if let Some(summary) = sub
                    .summary_function_name
                    .as_deref()
                    .filter(|name| !name.is_empty())
                {
                    script.summary(summary).map_err(script_error)?;
                }
            }
        }

        Ok(())
    }
}

/// Parse a config from its raw JSON text
pub fn parse_config(raw: &str) -> Result<Config, ConfigError> {
    let config = serde_json::from_str(raw)?;
    trace!("parsed config: {config:?}");
    Ok(config)
}

/// Read a config file, returning the raw text alongside the parsed config.
///
/// The raw text is kept so the admin API can hand back exactly what was
/// accepted.
pub fn load_config(path: impl AsRef<Path>) -> Result<(String, Config), ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let config = parse_config(&raw)?;
    Ok((raw, config))
}
