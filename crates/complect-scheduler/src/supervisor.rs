//! Worker process supervision.
//!
//! One child process per worker spec. Dead children are restarted with the
//! same spec, so the replacement recovers the tasks its predecessor held.

use complect_config::WorkerSpec;
use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

pub const LIVENESS_INTERVAL: Duration = Duration::from_millis(100);

struct Slot {
    spec: WorkerSpec,
    child: Option<Child>,
    restarts: u32,
}

/// Owns the table of worker processes.
pub struct Supervisor {
    program: PathBuf,
    /// Arguments placed before `worker --name <name>`, e.g. `--config <path>`.
    base_args: Vec<OsString>,
    slots: Vec<Slot>,
}

impl Supervisor {
    pub fn new(program: impl Into<PathBuf>, base_args: Vec<OsString>, specs: Vec<WorkerSpec>) -> Self {
        let slots = specs
            .into_iter()
            .map(|spec| Slot {
                spec,
                child: None,
                restarts: 0,
            })
            .collect();
        Self {
            program: program.into(),
            base_args,
            slots,
        }
    }

    fn command(&self, spec: &WorkerSpec) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .arg("worker")
            .arg("--name")
            .arg(&spec.name)
            .kill_on_drop(true);
        cmd
    }

    fn spawn(&self, spec: &WorkerSpec) -> Option<Child> {
        match self.command(spec).spawn() {
            Ok(child) => {
                info!(worker = %spec.name, pid = ?child.id(), "Started worker");
                Some(child)
            }
            Err(e) => {
                error!(worker = %spec.name, error = %e, "Failed to start worker");
                None
            }
        }
    }

    /// Launch every worker that is not running.
    pub fn start(&mut self) {
        for i in 0..self.slots.len() {
            if self.slots[i].child.is_none() {
                let child = self.spawn(&self.slots[i].spec);
                self.slots[i].child = child;
            }
        }
    }

    /// Restart workers that exited. Returns how many were restarted.
    pub fn ensure_alive(&mut self) -> usize {
        let mut restarted = 0;
        for i in 0..self.slots.len() {
            let exited = match self.slots[i].child.as_mut().map(|c| c.try_wait()) {
                Some(Ok(None)) => false,
                Some(Ok(Some(status))) => {
                    warn!(worker = %self.slots[i].spec.name, %status, "Worker exited");
                    true
                }
                Some(Err(e)) => {
                    warn!(worker = %self.slots[i].spec.name, error = %e, "Can't poll worker");
                    true
                }
                None => true,
            };
            if exited {
                let child = self.spawn(&self.slots[i].spec);
                let slot = &mut self.slots[i];
                slot.restarts += 1;
                slot.child = child;
                restarted += 1;
            }
        }
        restarted
    }

    /// Kill all workers and wait for them to exit.
    pub async fn terminate(&mut self) {
        for slot in &mut self.slots {
            if let Some(mut child) = slot.child.take() {
                if let Err(e) = child.kill().await {
                    warn!(worker = %slot.spec.name, error = %e, "Failed to kill worker");
                }
            }
        }
        info!("All workers terminated");
    }

    pub fn running(&self) -> usize {
        self.slots.iter().filter(|s| s.child.is_some()).count()
    }

    pub fn restarts(&self, name: &str) -> Option<u32> {
        self.slots
            .iter()
            .find(|s| s.spec.name == name)
            .map(|s| s.restarts)
    }

    /// Start the workers and keep them alive until Ctrl-C or SIGTERM.
    pub async fn run(self) -> io::Result<()> {
        let shutdown = shutdown_signal()?;
        self.run_until(shutdown).await
    }

    /// Start the workers and keep them alive until `shutdown` resolves,
    /// then kill them all.
    pub async fn run_until<F>(mut self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = io::Result<&'static str>>,
    {
        self.start();
        info!(workers = self.slots.len(), "Supervising workers");

        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(LIVENESS_INTERVAL);

        loop {
            tokio::select! {
                signal = &mut shutdown => {
                    let signal = signal?;
                    info!(signal, "Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    self.ensure_alive();
                }
            }
        }

        self.terminate().await;
        Ok(())
    }
}

/// Resolves with the signal name on Ctrl-C, or SIGTERM on unix.
/// The SIGTERM handler is installed before this returns.
#[cfg(unix)]
pub fn shutdown_signal() -> io::Result<impl Future<Output = io::Result<&'static str>>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            interrupted = tokio::signal::ctrl_c() => interrupted.map(|_| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    })
}

#[cfg(not(unix))]
pub fn shutdown_signal() -> io::Result<impl Future<Output = io::Result<&'static str>>> {
    Ok(async { tokio::signal::ctrl_c().await.map(|_| "Ctrl-C") })
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if let Some(child) = slot.child.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str, names: &[&str]) -> Supervisor {
        let base_args = vec!["-c".into(), script.into(), "sh".into()];
        let specs = names.iter().map(|n| WorkerSpec::plain(*n)).collect();
        Supervisor::new("sh", base_args, specs)
    }

    #[tokio::test]
    async fn test_start_and_terminate() {
        let mut supervisor = shell("sleep 30", &["testcase", "suite"]);
        supervisor.start();
        assert_eq!(supervisor.running(), 2);
        assert_eq!(supervisor.ensure_alive(), 0);

        supervisor.terminate().await;
        assert_eq!(supervisor.running(), 0);
    }

    #[tokio::test]
    async fn test_dead_worker_is_restarted() {
        let mut supervisor = shell("exit 3", &["testcase"]);
        supervisor.start();

        let mut restarted = 0;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            restarted += supervisor.ensure_alive();
            if restarted > 0 {
                break;
            }
        }

        assert!(restarted > 0);
        assert!(supervisor.restarts("testcase").unwrap() >= 1);
        assert_eq!(supervisor.running(), 1);
        supervisor.terminate().await;
    }

    #[tokio::test]
    async fn test_worker_arguments() {
        let supervisor = Supervisor::new(
            "/usr/bin/complect",
            vec!["--config".into(), "/etc/complect.kdl".into()],
            vec![WorkerSpec::plain("dictionary")],
        );
        let cmd = supervisor.command(&supervisor.slots[0].spec);
        let args: Vec<_> = cmd.as_std().get_args().map(|a| a.to_string_lossy().to_string()).collect();
        assert_eq!(args, vec!["--config", "/etc/complect.kdl", "worker", "--name", "dictionary"]);
    }

    #[tokio::test]
    async fn test_run_until_terminates_workers() {
        let supervisor = shell("sleep 30", &["testcase", "suite"]);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let running = tokio::spawn(supervisor.run_until(async move {
            let _ = rx.await;
            Ok("SIGTERM")
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        let stopped = tokio::time::timeout(Duration::from_secs(5), running).await;
        assert!(stopped.unwrap().unwrap().is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_requests_shutdown() {
        let shutdown = shutdown_signal().unwrap();
        let status = tokio::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .await
            .unwrap();
        assert!(status.success());

        let signal = tokio::time::timeout(Duration::from_secs(5), shutdown)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal, "SIGTERM");
    }

    #[tokio::test]
    async fn test_unspawnable_program_is_retried() {
        let mut supervisor = Supervisor::new(
            "/nonexistent/complect",
            Vec::new(),
            vec![WorkerSpec::plain("testcase")],
        );
        supervisor.start();
        assert_eq!(supervisor.running(), 0);
        assert_eq!(supervisor.ensure_alive(), 1);
        assert_eq!(supervisor.running(), 0);
    }
}
