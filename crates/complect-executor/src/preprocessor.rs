//! Preprocessor running configured external commands.

use async_trait::async_trait;
use complect_config::PreprocessorConfig;
use complect_core::{DownloadOutcome, ExecResult, Preprocessor};
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::command;

/// Runs the configured download and preprocess command lines.
///
/// Arguments may contain `{gateway}`, `{complect_id}`, `{root_dir}` and
/// `{base_path}` placeholders.
pub struct CommandPreprocessor {
    config: PreprocessorConfig,
    gateway_url: String,
}

impl CommandPreprocessor {
    pub fn new(config: PreprocessorConfig, gateway_url: Option<String>) -> Self {
        Self {
            config,
            gateway_url: gateway_url.unwrap_or_default(),
        }
    }

    fn substitute(
        &self,
        argv: &[String],
        complect_id: &str,
        root_dir: &Path,
        base_path: &Path,
    ) -> Vec<String> {
        let root_dir = root_dir.display().to_string();
        let base_path = base_path.display().to_string();
        argv.iter()
            .map(|arg| {
                arg.replace("{gateway}", &self.gateway_url)
                    .replace("{complect_id}", complect_id)
                    .replace("{root_dir}", &root_dir)
                    .replace("{base_path}", &base_path)
            })
            .collect()
    }

    async fn run(&self, argv: Vec<String>) -> ExecResult {
        let Some((program, args)) = argv.split_first() else {
            return ExecResult::spawn_failure("no command configured");
        };
        info!(program = %program, args = ?args, "Running");

        let result = match command::run_program(program, args, None).await {
            Ok(result) => result,
            Err(e) => ExecResult::spawn_failure(format!("failed to start {}: {}", program, e)),
        };
        info!(code = result.code, out = %result.out, err = %result.err, "Result of {}", program);
        result
    }

    /// The single directory the download step left under the source dir.
    async fn source_dir(&self, root_dir: &Path) -> Result<PathBuf, String> {
        let Some(source) = &self.config.source_dir else {
            return Ok(root_dir.to_path_buf());
        };
        let parent = root_dir.join(source);
        let unreadable = |e: std::io::Error| format!("can't read {}: {}", parent.display(), e);
        let mut entries = tokio::fs::read_dir(&parent).await.map_err(unreadable)?;

        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(unreadable)? {
            let path = entry.path();
            if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
                dirs.push(path);
            }
        }
        dirs.sort();

        match dirs.len() {
            0 => Err(format!("no source directory under {}", parent.display())),
            1 => Ok(dirs.remove(0)),
            n => {
                error!(parent = %parent.display(), count = n, "More than one source directory");
                Ok(dirs.remove(0))
            }
        }
    }
}

#[async_trait]
impl Preprocessor for CommandPreprocessor {
    async fn download(&self, root_dir: &Path, complect_id: &str) -> DownloadOutcome {
        let argv = self.substitute(&self.config.download, complect_id, root_dir, root_dir);
        let mut result = self.run(argv).await;

        if !result.success() {
            return DownloadOutcome {
                base_path: root_dir.to_path_buf(),
                result,
            };
        }

        match self.source_dir(root_dir).await {
            Ok(base_path) => DownloadOutcome { base_path, result },
            Err(reason) => {
                if !result.err.is_empty() && !result.err.ends_with('\n') {
                    result.err.push('\n');
                }
                result.err.push_str(&reason);
                DownloadOutcome {
                    base_path: root_dir.to_path_buf(),
                    result,
                }
            }
        }
    }

    async fn preprocess(&self, base_path: &Path) -> ExecResult {
        if self.config.preprocess.is_empty() {
            return ExecResult::ok();
        }
        let argv = self.substitute(&self.config.preprocess, "", base_path, base_path);
        self.run(argv).await
    }
}
