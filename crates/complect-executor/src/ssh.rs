//! SSH transport over the system `ssh` and `scp` binaries.
//!
//! One control-master connection is opened by `connect` and shared by every
//! command and transfer until `close`.

use complect_config::SshConfig;
use complect_core::{Error, ExecResult, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::command;

const CONTROL_SOCKET: &str = "master.sock";
const MASTER_LOG: &str = "master.log";

pub struct SshSession {
    config: SshConfig,
    control_dir: Option<TempDir>,
}

impl SshSession {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            control_dir: None,
        }
    }

    pub fn destination(&self) -> String {
        self.config.destination()
    }

    fn control_path(&self) -> Option<PathBuf> {
        self.control_dir
            .as_ref()
            .map(|dir| dir.path().join(CONTROL_SOCKET))
    }

    /// Options shared by ssh and scp; `port_flag` differs between them.
    fn common_args(&self, port_flag: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(port) = self.config.port {
            args.push(port_flag.to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.config.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        if let Some(control) = self.control_path() {
            args.push("-o".to_string());
            args.push(format!("ControlPath={}", control.display()));
        }
        args
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.control_dir.is_some() {
            return Ok(());
        }

        let dir = tempfile::Builder::new().prefix("complect-ssh").tempdir()?;
        let log_path = dir.path().join(MASTER_LOG);
        let log = std::fs::File::create(&log_path)?;
        self.control_dir = Some(dir);

        info!(destination = %self.destination(), "Opening SSH master connection");

        // The forked master keeps its stderr open, so it goes to a file
        // instead of a pipe we would wait on forever.
        let status = Command::new("ssh")
            .args(self.common_args("-p"))
            .args(["-o", "ControlMaster=yes", "-o", "ControlPersist=10m", "-f", "-N"])
            .arg(self.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .status()
            .await?;

        if !status.success() {
            let reason = std::fs::read_to_string(&log_path).unwrap_or_default();
            self.control_dir = None;
            return Err(Error::Remote(format!(
                "ssh connection to {} failed ({}): {}",
                self.destination(),
                status,
                reason.trim()
            )));
        }

        info!(destination = %self.destination(), "Connected");
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        let Some(control) = self.control_path() else {
            return Ok(());
        };

        let result = command::run(
            Command::new("ssh")
                .args(["-o", &format!("ControlPath={}", control.display())])
                .args(["-O", "exit"])
                .arg(self.destination()),
        )
        .await;
        self.control_dir = None;

        match result {
            Ok(r) if r.success() => debug!(destination = %self.destination(), "SSH master closed"),
            Ok(r) => warn!(destination = %self.destination(), err = %r.err, "SSH master exit failed"),
            Err(e) => warn!(destination = %self.destination(), error = %e, "SSH master exit failed"),
        }
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.control_dir.is_none() {
            return Err(Error::Remote(format!(
                "not connected to {}",
                self.destination()
            )));
        }
        Ok(())
    }

    /// Run a shell command on the remote host.
    pub async fn exec(&self, remote_command: &str) -> Result<ExecResult> {
        self.ensure_connected()?;
        info!(destination = %self.destination(), command = remote_command, "Running");

        let result = command::run(
            Command::new("ssh")
                .args(self.common_args("-p"))
                .arg(self.destination())
                .arg("--")
                .arg(remote_command),
        )
        .await?;

        info!(
            code = result.code,
            out = %result.out,
            err = %result.err,
            "Executed {}",
            remote_command
        );
        Ok(result)
    }

    /// Run a command that must succeed, returning its output.
    pub async fn check_exec(&self, remote_command: &str) -> Result<ExecResult> {
        let result = self.exec(remote_command).await?;
        if !result.success() {
            return Err(Error::CommandFailed(format!(
                "non-zero exit code {} from `{}` on {}: {}",
                result.code,
                remote_command,
                self.destination(),
                result.err.trim()
            )));
        }
        Ok(result)
    }

    async fn scp(&self, from: String, to: String) -> Result<()> {
        self.ensure_connected()?;
        info!(from = %from, to = %to, "Copying file");

        let result = command::run(
            Command::new("scp")
                .args(self.common_args("-P"))
                .arg("-q")
                .arg(&from)
                .arg(&to),
        )
        .await?;

        if !result.success() {
            return Err(Error::Remote(format!(
                "scp {} -> {} failed with code {}: {}",
                from,
                to,
                result.code,
                result.err.trim()
            )));
        }
        Ok(())
    }

    /// Put a single local file at a remote file path.
    pub async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        self.scp(
            local.display().to_string(),
            format!("{}:{}", self.destination(), remote),
        )
        .await
    }

    /// Get a single remote file into a local file path.
    pub async fn get(&self, remote: &str, local: &Path) -> Result<()> {
        self.scp(
            format!("{}:{}", self.destination(), remote),
            local.display().to_string(),
        )
        .await
    }
}
