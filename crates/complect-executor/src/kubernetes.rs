//! Kubernetes backend: commands run in an engine pod through the API
//! server's exec endpoint.
//!
//! Uploads stream a tar archive into the pod; there is no remote archive file
//! and no second path mapping. The engine in a pod is managed by its
//! deployment, so `update` and `restart` are not available.

use async_trait::async_trait;
use chrono::Local;
use complect_config::KubernetesConfig;
use complect_core::{Backend, Capabilities, Error, ExecResult, RemotePath, Result, UploadOutcome};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{info, warn};

use crate::engine::{EngineCommands, mktemp_pattern};

pub struct KubernetesBackend {
    target: String,
    config: KubernetesConfig,
    data_path: String,
    engine: EngineCommands,
    client: Option<Client>,
}

impl KubernetesBackend {
    pub fn new(
        target: impl Into<String>,
        config: KubernetesConfig,
        data_path: impl Into<String>,
        engine: EngineCommands,
    ) -> Self {
        Self {
            target: target.into(),
            config,
            data_path: data_path.into(),
            engine,
            client: None,
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    async fn build_client(&self) -> Result<Client> {
        let client = match &self.config.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::Configuration(format!("kubeconfig {}: {}", path.display(), e))
                })?;
                let options = KubeConfigOptions::default();
                let config = Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| {
                        Error::Configuration(format!("kubeconfig {}: {}", path.display(), e))
                    })?;
                Client::try_from(config).map_err(|e| Error::Remote(e.to_string()))?
            }
            None => Client::try_default()
                .await
                .map_err(|e| Error::Remote(e.to_string()))?,
        };
        Ok(client)
    }

    fn pods(&self) -> Result<Api<Pod>> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| Error::Remote(format!("not connected to pod {}", self.config.pod)))?;
        Ok(match &self.config.namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::default_namespaced(client),
        })
    }

    fn attach_params(&self, stdin: bool) -> AttachParams {
        let mut params = AttachParams::default().stdin(stdin).stdout(true).stderr(true);
        if let Some(container) = &self.config.container {
            params = params.container(container.clone());
        }
        params
    }

    /// Run `argv` in the pod, optionally feeding `input` to its stdin.
    /// Returns the exit code with raw stdout and stderr.
    async fn exec_raw(
        &self,
        argv: Vec<String>,
        input: Option<Vec<u8>>,
    ) -> Result<(i32, Vec<u8>, Vec<u8>)> {
        let pods = self.pods()?;
        info!(pod = %self.config.pod, command = ?argv, "Running in pod");

        let mut attached = pods
            .exec(&self.config.pod, argv, &self.attach_params(input.is_some()))
            .await
            .map_err(|e| Error::Remote(format!("exec in pod {}: {}", self.config.pod, e)))?;

        let stdin = attached.stdin();
        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();

        let write_in = async {
            if let (Some(mut writer), Some(bytes)) = (stdin, input) {
                writer.write_all(&bytes).await?;
                writer.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let read_out = async {
            let mut buf = Vec::new();
            if let Some(mut reader) = stdout {
                reader.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let read_err = async {
            let mut buf = Vec::new();
            if let Some(mut reader) = stderr {
                reader.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let ((), out, err) = tokio::try_join!(write_in, read_out, read_err)?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        if let Err(e) = attached.join().await {
            warn!(pod = %self.config.pod, error = %e, "Pod exec did not shut down cleanly");
        }

        Ok((exit_code(status.as_ref()), out, err))
    }

    async fn exec(&self, argv: Vec<String>, input: Option<Vec<u8>>) -> Result<ExecResult> {
        let (code, out, err) = self.exec_raw(argv, input).await?;
        let result = ExecResult::new(
            code,
            String::from_utf8_lossy(&out),
            String::from_utf8_lossy(&err),
        );
        info!(code = result.code, out = %result.out, err = %result.err, "Pod command finished");
        Ok(result)
    }

    async fn mktemp(&self) -> Result<String> {
        let pattern = mktemp_pattern(Local::now());
        let result = self
            .exec(
                vec![
                    "mktemp".to_string(),
                    "-d".to_string(),
                    "-t".to_string(),
                    pattern,
                    "-p".to_string(),
                    self.data_path.clone(),
                ],
                None,
            )
            .await?;
        let dir = result.out.trim_end().to_string();
        if !result.success() || dir.is_empty() {
            return Err(Error::CommandFailed(format!(
                "mktemp in pod {} failed with code {}: {}",
                self.config.pod,
                result.code,
                result.err.trim()
            )));
        }
        Ok(dir)
    }
}

/// Exit code from the exec status channel.
///
/// The API server reports success with no code and a failure's code as an
/// `ExitCode` cause.
pub(crate) fn exit_code(status: Option<&Status>) -> i32 {
    let Some(status) = status else {
        return -1;
    };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|c| c.message.as_deref())
        .and_then(|m| m.parse().ok())
        .unwrap_or(-1)
}

/// Archive a local file or directory contents as an uncompressed tar stream.
async fn tar_stream(local_path: &Path) -> Result<Vec<u8>> {
    let mut tar = Command::new("tar");
    tar.arg("-cf").arg("-");
    if local_path.is_dir() {
        tar.arg("-C").arg(local_path).arg(".");
    } else {
        let parent = local_path.parent().unwrap_or_else(|| Path::new("."));
        let name = local_path.file_name().ok_or_else(|| {
            Error::InvalidInput(format!("nothing to upload at {}", local_path.display()))
        })?;
        tar.arg("-C").arg(parent).arg(name);
    }

    let output = tar
        .stdin(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .output()
        .await?;
    if !output.status.success() {
        return Err(Error::CommandFailed(format!(
            "archiving {} failed: {}",
            local_path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output.stdout)
}

#[async_trait]
impl Backend for KubernetesBackend {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            update: false,
            restart: false,
            get_file: true,
        }
    }

    async fn connect(&mut self) -> Result<()> {
        if self.client.is_none() {
            self.client = Some(self.build_client().await?);
        }
        info!(pod = %self.config.pod, "Connected to cluster");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }

    async fn upload(&mut self, local_path: &Path) -> Result<UploadOutcome> {
        let remote_dir = self.mktemp().await?;
        let archive = tar_stream(local_path).await?;

        let result = self
            .exec(
                vec![
                    "tar".to_string(),
                    "-xf".to_string(),
                    "-".to_string(),
                    "-C".to_string(),
                    remote_dir.clone(),
                ],
                Some(archive),
            )
            .await?;

        Ok(UploadOutcome {
            path: RemotePath::same(remote_dir),
            result,
        })
    }

    async fn compile(&mut self, path: &RemotePath) -> Result<ExecResult> {
        self.exec(self.engine.compile_argv(&path.engine_path), None)
            .await
    }

    async fn update(&mut self, _path: &RemotePath) -> Result<ExecResult> {
        Err(Error::Unsupported {
            backend: "kubernetes",
            operation: "update",
        })
    }

    async fn restart(&mut self) -> Result<ExecResult> {
        Err(Error::Unsupported {
            backend: "kubernetes",
            operation: "restart",
        })
    }

    async fn get_file(&mut self, remote_path: &str, local_path: &Path) -> Result<()> {
        let (code, out, err) = self
            .exec_raw(vec!["cat".to_string(), remote_path.to_string()], None)
            .await?;
        if code != 0 {
            return Err(Error::Remote(format!(
                "reading {} from pod {} failed with code {}: {}",
                remote_path,
                self.config.pod,
                code,
                String::from_utf8_lossy(&err).trim()
            )));
        }
        tokio::fs::write(local_path, out).await?;
        Ok(())
    }
}
