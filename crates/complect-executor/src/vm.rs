//! Dedicated host backend: engine binaries run directly over SSH.

use async_trait::async_trait;
use complect_config::SshConfig;
use complect_core::{Backend, ExecResult, RemotePath, Result, UploadOutcome};
use std::path::Path;

use crate::engine::EngineCommands;
use crate::host::SshHost;
use crate::ssh::SshSession;

pub struct VirtualMachineBackend {
    target: String,
    host: SshHost,
    engine: EngineCommands,
}

impl VirtualMachineBackend {
    pub fn new(
        target: impl Into<String>,
        ssh: SshConfig,
        data_path: impl Into<String>,
        engine: EngineCommands,
    ) -> Self {
        Self {
            target: target.into(),
            host: SshHost::new(SshSession::new(ssh), data_path),
            engine,
        }
    }
}

#[async_trait]
impl Backend for VirtualMachineBackend {
    fn name(&self) -> &'static str {
        "ssh"
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
        Ok(UploadOutcome {
            path: RemotePath::same(remote_dir),
            result,
        })
    }

    async fn compile(&mut self, path: &RemotePath) -> Result<ExecResult> {
        self.host
            .session
            .exec(&self.engine.compile_in(&path.engine_path))
            .await
    }

    async fn update(&mut self, path: &RemotePath) -> Result<ExecResult> {
        self.host
            .session
            .exec(&self.engine.update(&path.engine_path))
            .await
    }

    async fn restart(&mut self) -> Result<ExecResult> {
        self.host.session.exec(&self.engine.restart()).await
    }

    async fn get_file(&mut self, remote_path: &str, local_path: &Path) -> Result<()> {
        self.host.session.get(remote_path, local_path).await
    }
}
