//! Local process execution.

use complect_core::ExecResult;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Run a command to completion, capturing exit code and output.
///
/// Only a failure to start the process is an error; a non-zero exit is
/// reported through the returned `ExecResult`.
pub async fn run(command: &mut Command) -> std::io::Result<ExecResult> {
    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    let result = ExecResult::new(
        // Killed by a signal.
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    );
    debug!(code = result.code, "Command finished");
    Ok(result)
}

/// Run `program args..` optionally inside `cwd`.
pub async fn run_program<S: AsRef<str>>(
    program: &str,
    args: &[S],
    cwd: Option<&Path>,
) -> std::io::Result<ExecResult> {
    let mut command = Command::new(program);
    command.args(args.iter().map(|a| a.as_ref()));
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    run(&mut command).await
}

/// Quote a word for a POSIX shell. Words made of safe characters are
/// returned unchanged.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:,@%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/dldata/complect_x"), "/dldata/complect_x");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("cd /x && ls"), "'cd /x && ls'");
    }

    #[tokio::test]
    async fn test_run_captures_output_and_code() {
        let result = run_program("sh", &["-c", "echo out; echo err >&2; exit 3"], None)
            .await
            .unwrap();
        assert_eq!(result.code, 3);
        assert_eq!(result.out, "out\n");
        assert_eq!(result.err, "err\n");
    }

    #[tokio::test]
    async fn test_run_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_program("pwd", &[] as &[&str], Some(dir.path())).await.unwrap();
        assert!(result.success());
        let printed = std::fs::canonicalize(result.out.trim()).unwrap();
        assert_eq!(printed, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let result = run_program("/nonexistent/binary", &["x"], None).await;
        assert!(result.is_err());
    }
}
