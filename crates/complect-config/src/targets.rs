//! Remote target configuration.
//!
//! A target is one logical endpoint a backend drives. Compiler targets build
//! artifacts; deployer targets receive them.

use crate::nodes::{
    get_bool_prop, get_child_string, get_first_string_arg, get_string_prop, get_u64_prop,
};
use crate::{ConfigError, ConfigResult};
use kdl::KdlNode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default mount point of the data path inside an engine container.
pub const DEFAULT_CONTAINER_VOLUME: &str = "/root/volume";

/// Default upload root inside a Kubernetes pod.
pub const DEFAULT_POD_DATA_PATH: &str = "/tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetRole {
    Compiler,
    Deployer,
}

impl TargetRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetRole::Compiler => "compiler",
            TargetRole::Deployer => "deployer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    pub host: String,
    pub user: String,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
}

impl SshConfig {
    /// `user@host` destination for ssh and scp.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesConfig {
    pub pod: String,
    pub namespace: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub container: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetKind {
    Ssh(SshConfig),
    Kubernetes(KubernetesConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    pub name: String,
    pub role: TargetRole,
    /// Exclusive targets only take tasks routed to their group or name.
    pub exclusive: bool,
    pub group: Option<String>,
    pub kind: TargetKind,
    pub engine_path: String,
    /// Parent directory for uploads on the remote side.
    pub data_path: String,
    /// Engine container on an SSH host; selects the container-exec variant.
    pub container: Option<String>,
    pub container_volume: String,
    pub strict: bool,
}

impl RemoteTarget {
    /// Value of the `target` task argument this target's worker accepts.
    pub fn routing_key(&self) -> String {
        if self.exclusive {
            self.group.clone().unwrap_or_else(|| self.name.clone())
        } else {
            String::new()
        }
    }

    /// Backend variant this target is driven by.
    pub fn variant(&self) -> &'static str {
        match (&self.kind, &self.container) {
            (TargetKind::Kubernetes(_), _) => "kubernetes",
            (TargetKind::Ssh(_), Some(_)) => "docker",
            (TargetKind::Ssh(_), None) => "ssh",
        }
    }
}

pub(crate) fn parse_target(node: &KdlNode, role: TargetRole) -> ConfigResult<RemoteTarget> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("{} name", role.as_str())))?;

    let exclusive = get_bool_prop(node, "exclusive").unwrap_or(false);
    let group = get_string_prop(node, "group");
    if !exclusive && group.is_some() {
        return Err(ConfigError::InvalidValue {
            field: format!("group of {} '{}'", role.as_str(), name),
            message: "only exclusive targets can belong to a group".to_string(),
        });
    }

    let mut kind = None;
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "ssh" => kind = Some(TargetKind::Ssh(parse_ssh(child, &name)?)),
                "kubernetes" => {
                    kind = Some(TargetKind::Kubernetes(parse_kubernetes(child, &name)?))
                }
                _ => {}
            }
        }
    }
    let kind = kind.ok_or_else(|| {
        ConfigError::MissingField(format!("ssh or kubernetes connection for '{}'", name))
    })?;

    let engine_path = get_child_string(node, "engine-path").unwrap_or_default();
    if engine_path.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "engine-path for '{}'",
            name
        )));
    }

    let data_path = match (&kind, get_child_string(node, "data-path")) {
        (_, Some(path)) => path,
        (TargetKind::Kubernetes(_), None) => DEFAULT_POD_DATA_PATH.to_string(),
        (TargetKind::Ssh(_), None) => {
            return Err(ConfigError::MissingField(format!(
                "data-path for '{}'",
                name
            )));
        }
    };

    let container = get_child_string(node, "container").filter(|c| !c.is_empty());
    let container_volume = get_child_string(node, "container-volume")
        .unwrap_or_else(|| DEFAULT_CONTAINER_VOLUME.to_string());
    let strict = node
        .children()
        .and_then(|children| children.get("strict"))
        .and_then(|n| n.entries().first())
        .and_then(|e| e.value().as_bool())
        .unwrap_or(false);

    Ok(RemoteTarget {
        name,
        role,
        exclusive,
        group,
        kind,
        engine_path,
        data_path,
        container,
        container_volume,
        strict,
    })
}

fn parse_ssh(node: &KdlNode, target: &str) -> ConfigResult<SshConfig> {
    let host = get_string_prop(node, "host")
        .ok_or_else(|| ConfigError::MissingField(format!("ssh host for '{}'", target)))?;
    let user = get_string_prop(node, "user").unwrap_or_else(|| "root".to_string());
    let port = get_u64_prop(node, "port")?
        .map(|p| {
            u16::try_from(p).map_err(|_| ConfigError::InvalidValue {
                field: format!("ssh port for '{}'", target),
                message: format!("{} is out of range", p),
            })
        })
        .transpose()?;
    let identity_file = get_string_prop(node, "identity-file").map(PathBuf::from);

    Ok(SshConfig {
        host,
        user,
        port,
        identity_file,
    })
}

fn parse_kubernetes(node: &KdlNode, target: &str) -> ConfigResult<KubernetesConfig> {
    let pod = get_string_prop(node, "pod")
        .ok_or_else(|| ConfigError::MissingField(format!("kubernetes pod for '{}'", target)))?;

    Ok(KubernetesConfig {
        pod,
        namespace: get_string_prop(node, "namespace"),
        kubeconfig: get_string_prop(node, "kubeconfig").map(PathBuf::from),
        container: get_string_prop(node, "container"),
    })
}
