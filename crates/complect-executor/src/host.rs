//! Upload and housekeeping on an SSH-reachable host.

use chrono::Local;
use complect_core::{Error, ExecResult, Result};
use std::path::Path;
use tokio::process::Command;
use tracing::info;

use crate::command;
use crate::engine::{ARCHIVE_NAME, extract_command, mktemp_command, remote_parent, sweep_command};
use crate::ssh::SshSession;

pub struct SshHost {
    pub session: SshSession,
    data_path: String,
}

impl SshHost {
    pub fn new(session: SshSession, data_path: impl Into<String>) -> Self {
        Self {
            session,
            data_path: data_path.into(),
        }
    }

    pub fn data_path(&self) -> &str {
        &self.data_path
    }

    /// Create a uniquely named directory under the data path.
    pub async fn mktemp(&self) -> Result<String> {
        let result = self
            .session
            .check_exec(&mktemp_command(&self.data_path, Local::now()))
            .await?;
        let dir = result.out.trim_end().to_string();
        if dir.is_empty() {
            return Err(Error::CommandFailed(format!(
                "mktemp on {} printed no directory",
                self.session.destination()
            )));
        }
        Ok(dir)
    }

    /// Upload a local file or directory into a fresh remote directory.
    ///
    /// Directories travel as one archive that is unpacked remotely; the
    /// unpack result is returned. Remote entries past retention under the
    /// data path are removed afterwards.
    pub async fn upload(&self, local_path: &Path) -> Result<(String, ExecResult)> {
        let remote_dir = self.mktemp().await?;

        let result = if local_path.is_dir() {
            let scratch = tempfile::Builder::new().prefix("complect-upload").tempdir()?;
            let archive = scratch.path().join(ARCHIVE_NAME);

            let packed = command::run(
                Command::new("tar")
                    .arg("-czf")
                    .arg(&archive)
                    .arg("-C")
                    .arg(local_path)
                    .arg("."),
            )
            .await?;
            if !packed.success() {
                return Err(Error::CommandFailed(format!(
                    "archiving {} failed with code {}: {}",
                    local_path.display(),
                    packed.code,
                    packed.err.trim()
                )));
            }

            self.session
                .put(&archive, &format!("{}/{}", remote_dir, ARCHIVE_NAME))
                .await?;
            self.session.exec(&extract_command(&remote_dir)).await?
        } else {
            let name = local_path.file_name().ok_or_else(|| {
                Error::InvalidInput(format!("nothing to upload at {}", local_path.display()))
            })?;
            self.session
                .put(local_path, &format!("{}/{}", remote_dir, name.to_string_lossy()))
                .await?;
            ExecResult::ok()
        };

        self.sweep(&remote_parent(&remote_dir)).await;
        Ok((remote_dir, result))
    }

    /// Remove remote entries older than the retention period. Only logged.
    pub async fn sweep(&self, parent: &str) {
        let cmd = sweep_command(parent);
        match self.session.exec(&cmd).await {
            Ok(result) => info!(
                command = %cmd,
                code = result.code,
                err = %result.err,
                "Swept old remote files"
            ),
            Err(e) => info!(command = %cmd, error = %e, "Remote sweep failed"),
        }
    }
}
