//! Local working directory hygiene.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

/// Delete files under `dir` last modified more than `older_than` ago.
///
/// Directories that were old when scanned are removed once empty. `dir`
/// itself is kept. Returns the number of removed entries.
pub fn sweep_local(dir: &Path, older_than: Duration) -> io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let cutoff = SystemTime::now()
        .checked_sub(older_than)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut expired: Vec<(PathBuf, bool)> = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        let modified = entry.metadata().map_err(io::Error::other)?.modified()?;
        if modified < cutoff {
            expired.push((entry.path().to_path_buf(), entry.file_type().is_dir()));
        }
    }

    let mut removed = 0;
    // Children come after their parent in walk order.
    for (path, is_dir) in expired.into_iter().rev() {
        let outcome = if is_dir {
            std::fs::remove_dir(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match outcome {
            Ok(()) => removed += 1,
            Err(e) if is_dir => {
                tracing::debug!(path = %path.display(), error = %e, "Keeping directory");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}
