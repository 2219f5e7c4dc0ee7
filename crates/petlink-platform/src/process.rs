use std::{
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use petlink_observability::Span;

use crate::config::RunContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Running,
    Stopped,
    Failed,
}

/// How the worker is stopped at quit. The packaged worker has no cooperative
/// shutdown channel, so every strategy works from the pid alone.
pub trait TerminationStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn terminate(&self, pid: u32) -> Result<()>;
}

/// `taskkill /T /F`: forced kill of the worker and everything it spawned.
pub struct ForcedTreeKill;

impl TerminationStrategy for ForcedTreeKill {
    fn name(&self) -> &'static str {
        "forced_tree_kill"
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        let status = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("taskkill failed")?;
        if !status.success() {
            return Err(anyhow!("taskkill exit={status}"));
        }
        Ok(())
    }
}

/// Standard SIGTERM.
pub struct SignalTerm;

impl TerminationStrategy for SignalTerm {
    fn name(&self) -> &'static str {
        "signal_term"
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        let status = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("kill failed")?;
        if !status.success() {
            return Err(anyhow!("kill exit={status}"));
        }
        Ok(())
    }
}

pub fn platform_strategy() -> Arc<dyn TerminationStrategy> {
    if cfg!(windows) {
        Arc::new(ForcedTreeKill)
    } else {
        Arc::new(SignalTerm)
    }
}

#[derive(Default)]
struct Inner {
    child: Option<Child>,
    pid: Option<u32>,
    status: Option<WorkerStatus>,
    terminated: bool,
}

/// Owns the single background worker of this application run.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Mutex<Inner>>,
    data_dir: PathBuf,
    worker_path: PathBuf,
    context: RunContext,
    strategy: Arc<dyn TerminationStrategy>,
}

impl ProcessSupervisor {
    pub fn new(data_dir: &Path, worker_path: PathBuf, context: RunContext) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            data_dir: data_dir.to_path_buf(),
            worker_path,
            context,
            strategy: platform_strategy(),
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn TerminationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn status(&self) -> Option<WorkerStatus> {
        self.lock().status
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    pub fn worker_path(&self) -> &Path {
        &self.worker_path
    }

    /// Launches the worker once per run. No-op in development (the worker is
    /// managed externally) and after any earlier attempt, successful or not.
    pub fn spawn(&self) -> Result<Option<u32>> {
        let span = Span::start(
            &self.data_dir,
            None,
            "Worker",
            "WORKER.spawn",
            Some(serde_json::json!({
                "path": self.worker_path.display().to_string(),
                "context": self.context,
            })),
        );
        if self.context == RunContext::Development {
            span.skipped("development context", None);
            return Ok(None);
        }

        let mut g = self.lock();
        if g.status.is_some() {
            let pid = g.pid;
            span.skipped("worker handle already exists", Some(serde_json::json!({"pid": pid})));
            return Ok(pid);
        }
        g.status = Some(WorkerStatus::Starting);

        let mut cmd = Command::new(&self.worker_path);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        match cmd.spawn() {
            Ok(child) => {
                let pid = child.id();
                g.pid = Some(pid);
                g.child = Some(child);
                g.status = Some(WorkerStatus::Running);
                span.ok(Some(serde_json::json!({"pid": pid})));
                Ok(Some(pid))
            }
            Err(e) => {
                g.status = Some(WorkerStatus::Failed);
                let err = anyhow!(e).context(format!(
                    "failed to spawn worker: {}",
                    self.worker_path.display()
                ));
                span.err_anyhow("process", "E_WORKER_SPAWN", &err, None);
                Err(err)
            }
        }
    }

    /// Spawn failures are traced and otherwise ignored; the UI still starts.
    pub fn spawn_best_effort(&self) -> Option<u32> {
        self.spawn().ok().flatten()
    }

    /// Stops the worker. Runs at most once per supervisor; failures are traced
    /// and swallowed so application exit is never held up.
    pub fn terminate(&self) {
        let mut g = self.lock();
        if g.terminated {
            return;
        }
        g.terminated = true;

        let span = Span::start(
            &self.data_dir,
            None,
            "Worker",
            "WORKER.terminate",
            Some(serde_json::json!({"pid": g.pid, "strategy": self.strategy.name()})),
        );
        let Some(pid) = g.pid else {
            span.skipped("no worker process", None);
            return;
        };

        match self.strategy.terminate(pid) {
            Ok(()) => {
                g.status = Some(WorkerStatus::Stopped);
                // Reap if it already exited; never wait.
                let exited = g
                    .child
                    .as_mut()
                    .and_then(|c| c.try_wait().ok().flatten())
                    .map(|s| s.to_string());
                span.ok(Some(serde_json::json!({"exited": exited})));
            }
            Err(e) => {
                g.status = Some(WorkerStatus::Failed);
                petlink_observability::safe_eprintln!("worker: terminate pid={pid} failed: {e:#}");
                span.err_anyhow("process", "E_WORKER_TERMINATE", &e, None);
            }
        }
    }
}
