//! Container backend: engine binaries run inside a Docker container on an
//! SSH-reachable host.
//!
//! Uploads and housekeeping happen on the host. The data path is mounted into
//! the container at the container volume, so every uploaded directory has a
//! second, in-container path used by the engine commands.

use async_trait::async_trait;
use complect_config::SshConfig;
use complect_core::{Backend, Error, ExecResult, RemotePath, Result, UploadOutcome};
use std::path::Path;
use tracing::debug;

use crate::command::shell_quote;
use crate::engine::EngineCommands;
use crate::host::SshHost;
use crate::ssh::SshSession;

pub struct DockerBackend {
    target: String,
    host: SshHost,
    engine: EngineCommands,
    container: String,
    container_volume: String,
}

impl DockerBackend {
    pub fn new(
        target: impl Into<String>,
        ssh: SshConfig,
        data_path: impl Into<String>,
        engine: EngineCommands,
        container: impl Into<String>,
        container_volume: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            host: SshHost::new(SshSession::new(ssh), data_path),
            engine,
            container: container.into(),
            container_volume: container_volume.into(),
        }
    }

    fn find_container_command(&self) -> String {
        format!(
            "sudo docker ps --format '{{{{.ID}}}}' --filter name={}",
            shell_quote(&self.container)
        )
    }

    /// Locate the running container by name on every call; it may have
    /// been recreated since the last command.
    async fn container_id(&self) -> Result<String> {
        let result = self
            .host
            .session
            .exec(&self.find_container_command())
            .await?;
        let id = parse_container_id(&result.out).ok_or_else(|| {
            Error::Configuration(format!(
                "can't find container '{}' on {}",
                self.container,
                self.host.session.destination()
            ))
        })?;
        debug!(container = %self.container, id = %id, "Found container");
        Ok(id)
    }

    async fn exec_in_container(&self, cmd: &str) -> Result<ExecResult> {
        let id = self.container_id().await?;
        self.host
            .session
            .exec(&wrap_in_container(&id, cmd))
            .await
    }
}

/// First container id listed by `docker ps --format '{{.ID}}'`.
pub(crate) fn parse_container_id(out: &str) -> Option<String> {
    out.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

pub(crate) fn wrap_in_container(id: &str, cmd: &str) -> String {
    format!("sudo docker exec {} bash -c {}", id, shell_quote(cmd))
}

/// Map a host path under `data_path` to the container volume.
pub(crate) fn container_path(
    data_path: &str,
    container_volume: &str,
    host_path: &str,
) -> Result<String> {
    let relative = Path::new(host_path)
        .strip_prefix(data_path)
        .map_err(|_| {
            Error::Configuration(format!(
                "uploaded path {} is outside data path {}",
                host_path, data_path
            ))
        })?;
    Ok(Path::new(container_volume)
        .join(relative)
        .display()
        .to_string())
}

#[async_trait]
impl Backend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn target(&self) -> &str {
        &self.target
    }

    async fn connect(&mut self) -> Result<()> {
        self.host.session.connect().await
    }

    async fn close(&mut self) -> Result<()> {
        self.host.session.close().await
    }

    async fn upload(&mut self, local_path: &Path) -> Result<UploadOutcome> {
        let (remote_dir, result) = self.host.upload(local_path).await?;
        let engine_path = container_path(self.host.data_path(), &self.container_volume, &remote_dir)?;
        Ok(UploadOutcome {
            path: RemotePath {
                remote_path: remote_dir,
                engine_path,
            },
            result,
        })
    }

    async fn compile(&mut self, path: &RemotePath) -> Result<ExecResult> {
        self.exec_in_container(&self.engine.compile_in(&path.engine_path))
            .await
    }

    async fn update(&mut self, path: &RemotePath) -> Result<ExecResult> {
        self.exec_in_container(&self.engine.update(&path.engine_path))
            .await
    }

    async fn restart(&mut self) -> Result<ExecResult> {
        self.exec_in_container(&self.engine.restart()).await
    }

    async fn get_file(&mut self, remote_path: &str, local_path: &Path) -> Result<()> {
        self.host.session.get(remote_path, local_path).await
    }
}
