//! System configuration parsing.

use crate::nodes::{
    get_all_string_args, get_child_string, get_first_string_arg, get_string_prop, get_u64_prop,
};
use crate::targets::{RemoteTarget, TargetRole, parse_target};
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_ROOT_DIR: &str = "/var/tmp";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// System-wide configuration, loaded once per process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub database: DatabaseConfig,
    /// Base URL of the task status notification listener.
    pub notifier_url: Option<String>,
    /// Base URL of the JSON-RPC gateway used for template lookups.
    pub gateway_url: Option<String>,
    pub worker: WorkerSettings,
    pub preprocessor: PreprocessorConfig,
    pub compilers: Vec<RemoteTarget>,
    pub deployers: Vec<RemoteTarget>,
    /// Task types served by plain workers without routing filters.
    pub worker_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    /// Local parent directory of per-compile working directories.
    pub root_dir: PathBuf,
}

/// External commands run by the command preprocessor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreprocessorConfig {
    pub download: Vec<String>,
    /// Directory under the download root holding the fetched sources.
    pub source_dir: Option<String>,
    pub preprocess: Vec<String>,
}

impl SystemConfig {
    pub fn database_url(&self) -> ConfigResult<&str> {
        self.database
            .url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ConfigError::MissingField("database url".to_string()))
    }

    pub fn compiler(&self, name: &str) -> ConfigResult<&RemoteTarget> {
        self.compilers
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| {
                ConfigError::InvalidReference(format!("unknown compiler target '{}'", name))
            })
    }

    pub fn deployer(&self, name: &str) -> ConfigResult<&RemoteTarget> {
        self.deployers
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| {
                ConfigError::InvalidReference(format!("unknown deployer target '{}'", name))
            })
    }

    /// Override values from the environment through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Some(url) = lookup("COMPLECT_NOTIFIER_URL") {
            self.notifier_url = Some(url);
        }
        if let Some(url) = lookup("COMPLECT_GATEWAY_URL") {
            self.gateway_url = Some(url);
        }
    }
}

/// Read the configuration file and apply environment overrides.
pub fn load_system_config(path: &Path) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    let mut config = parse_system_config(&text)?;
    config.apply_overrides(|key| std::env::var(key).ok());
    Ok(config)
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut database = DatabaseConfig {
        url: None,
        max_connections: DEFAULT_MAX_CONNECTIONS,
    };
    let mut notifier_url = None;
    let mut gateway_url = None;
    let mut worker = WorkerSettings {
        poll_interval: DEFAULT_POLL_INTERVAL,
        root_dir: PathBuf::from(DEFAULT_ROOT_DIR),
    };
    let mut preprocessor = PreprocessorConfig::default();
    let mut compilers = Vec::new();
    let mut deployers = Vec::new();
    let mut worker_types = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "database" => {
                database.url = get_string_prop(node, "url");
                if let Some(max) = get_u64_prop(node, "max-connections")? {
                    database.max_connections =
                        u32::try_from(max).map_err(|_| ConfigError::InvalidValue {
                            field: "max-connections".to_string(),
                            message: format!("{} is out of range", max),
                        })?;
                }
            }
            "notifier" => notifier_url = get_string_prop(node, "url"),
            "gateway" => gateway_url = get_string_prop(node, "url"),
            "worker" => {
                if let Some(ms) = get_u64_prop(node, "poll-interval-ms")? {
                    worker.poll_interval = Duration::from_millis(ms);
                }
                if let Some(dir) = get_string_prop(node, "root-dir") {
                    worker.root_dir = PathBuf::from(dir);
                }
            }
            "preprocessor" => preprocessor = parse_preprocessor(node),
            "compiler" => compilers.push(parse_target(node, TargetRole::Compiler)?),
            "deployer" => deployers.push(parse_target(node, TargetRole::Deployer)?),
            "worker-type" => {
                let name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("worker-type name".to_string()))?;
                if worker_types.contains(&name) {
                    return Err(ConfigError::Duplicate(format!("worker-type '{}'", name)));
                }
                worker_types.push(name);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    check_unique(&compilers, "compiler")?;
    check_unique(&deployers, "deployer")?;

    Ok(SystemConfig {
        database,
        notifier_url,
        gateway_url,
        worker,
        preprocessor,
        compilers,
        deployers,
        worker_types,
    })
}

fn parse_preprocessor(node: &KdlNode) -> PreprocessorConfig {
    let mut config = PreprocessorConfig {
        source_dir: get_child_string(node, "source-dir"),
        ..Default::default()
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "download" => config.download = get_all_string_args(child),
                "preprocess" => config.preprocess = get_all_string_args(child),
                _ => {}
            }
        }
    }

    config
}

fn check_unique(targets: &[RemoteTarget], section: &str) -> ConfigResult<()> {
    let mut seen = HashSet::new();
    for target in targets {
        if !seen.insert(target.name.as_str()) {
            return Err(ConfigError::Duplicate(format!(
                "{} '{}'",
                section, target.name
            )));
        }
    }
    Ok(())
}
