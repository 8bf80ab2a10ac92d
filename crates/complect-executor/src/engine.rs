//! Engine command lines shared by all backend variants.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

use crate::command::shell_quote;

/// Prefix of remote working directory names.
pub const TEMP_PREFIX: &str = "complect";

/// Name of the uploaded archive on the remote side.
pub const ARCHIVE_NAME: &str = "source.tgz";

/// File produced by the compiler in the uploaded directory.
pub const ARTIFACT_NAME: &str = "dldata.ie2";

/// `mktemp` template: timestamp plus eight random characters.
pub fn mktemp_pattern(now: DateTime<Local>) -> String {
    format!("{}_{}_XXXXXXXX", TEMP_PREFIX, now.format("%Y%m%d-%H%M%S"))
}

pub fn mktemp_command(parent: &str, now: DateTime<Local>) -> String {
    format!(
        "mktemp -d -t {} -p {}",
        mktemp_pattern(now),
        shell_quote(parent)
    )
}

/// Delete everything under `parent` older than the retention period.
pub fn sweep_command(parent: &str) -> String {
    format!(
        "find {} -mindepth 1 -mtime +{} -delete",
        shell_quote(parent),
        complect_core::RETENTION_DAYS
    )
}

pub fn extract_command(remote_dir: &str) -> String {
    let dir = shell_quote(remote_dir);
    format!(
        "cd {} && tar -xzf {} && rm {}",
        dir, ARCHIVE_NAME, ARCHIVE_NAME
    )
}

/// Parent directory of a remote path, as a string.
pub fn remote_parent(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string())
}

/// Command lines of the linguistic engine installed under `engine_path`.
#[derive(Debug, Clone)]
pub struct EngineCommands {
    engine_path: PathBuf,
    strict: bool,
}

impl EngineCommands {
    pub fn new(engine_path: impl Into<PathBuf>, strict: bool) -> Self {
        Self {
            engine_path: engine_path.into(),
            strict,
        }
    }

    fn compiler(&self) -> String {
        self.engine_path.join("bin/InfCompiler").display().to_string()
    }

    fn compiler_conf(&self) -> String {
        self.engine_path
            .join("conf/InfCompiler.conf")
            .display()
            .to_string()
    }

    fn strict_flag(&self) -> &'static str {
        if self.strict { "true" } else { "false" }
    }

    /// Shell command compiling sources in `dir` from inside that directory.
    pub fn compile_in(&self, dir: &str) -> String {
        format!(
            "cd {} && {} {} --dldata-root . --strict {}",
            shell_quote(dir),
            shell_quote(&self.compiler()),
            shell_quote(&self.compiler_conf()),
            self.strict_flag()
        )
    }

    /// Argument vector compiling sources rooted at `dir`.
    pub fn compile_argv(&self, dir: &str) -> Vec<String> {
        vec![
            self.compiler(),
            self.compiler_conf(),
            "--dldata-root".to_string(),
            dir.to_string(),
            "--strict".to_string(),
            self.strict_flag().to_string(),
        ]
    }

    pub fn update(&self, dir: &str) -> String {
        let artifact = Path::new(dir).join(ARTIFACT_NAME);
        format!(
            "InfEngineManager.pl --dl-update {} --verbose",
            shell_quote(&artifact.display().to_string())
        )
    }

    pub fn restart(&self) -> String {
        "InfEngineControl.pl --restart".to_string()
    }
}
