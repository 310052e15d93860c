pub mod database;
pub mod search;

use crate::error::{HarnessError, Result};
use crate::parse::DataDirectory;
use crate::process::{spawn_process, EmbeddedProcess, SpawnSpec};
use crate::teardown::{next_instance_id, Teardown, TeardownRegistry};
use crate::watcher::LogWatcher;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{watch, Mutex};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

pub use database::DatabaseClusterController;
pub use search::SearchEngineController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Created => "created",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Common control surface of the embedded database and search engine.
#[async_trait]
pub trait EmbeddedService: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> LifecycleState;

    /// Blocks until the service is fully usable.
    async fn start(&self) -> Result<()>;

    /// Idempotent; never fails.
    async fn stop(&self);
}

/// A data directory as resolved at start-up.
#[derive(Debug)]
pub enum ResolvedDataDir {
    /// Created by the controller; removed on stop.
    Owned(TempDir),
    Provided(PathBuf),
}

impl ResolvedDataDir {
    pub fn resolve(dir: &DataDirectory, prefix: &str) -> Result<Self> {
        match dir {
            DataDirectory::Ephemeral => {
                let tmp = tempfile::Builder::new().prefix(prefix).tempdir()?;
                debug!(path = %tmp.path().display(), "Created ephemeral data directory");
                Ok(ResolvedDataDir::Owned(tmp))
            }
            DataDirectory::Path(path) => {
                std::fs::create_dir_all(path)?;
                Ok(ResolvedDataDir::Provided(path.clone()))
            }
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            ResolvedDataDir::Owned(tmp) => tmp.path(),
            ResolvedDataDir::Provided(path) => path,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, ResolvedDataDir::Owned(_))
    }

    /// Removes the directory if owned; failures are logged.
    pub fn release(self, service: &str) {
        match self {
            ResolvedDataDir::Owned(tmp) => {
                let path = tmp.path().to_path_buf();
                match tmp.close() {
                    Ok(()) => info!(service, path = %path.display(), "Removed data directory"),
                    Err(e) => error!(service, path = %path.display(), error = %e, "Failed to remove data dir"),
                }
            }
            ResolvedDataDir::Provided(path) => {
                debug!(service, path = %path.display(), "Keeping caller-provided data directory");
            }
        }
    }
}

#[derive(Default)]
struct Embedded {
    process: Option<EmbeddedProcess>,
    output: Option<Arc<LogWatcher>>,
    data_dir: Option<ResolvedDataDir>,
}

/// Lifecycle bookkeeping shared by both controllers.
pub(crate) struct ServiceCore {
    name: String,
    id: u64,
    state: watch::Sender<LifecycleState>,
    stopped: AtomicBool,
    embedded: Mutex<Embedded>,
    stop_timeout: Duration,
    registry: &'static TeardownRegistry,
}

impl ServiceCore {
    pub(crate) fn new(
        name: impl Into<String>,
        stop_timeout: Duration,
        registry: &'static TeardownRegistry,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(LifecycleState::Created);
        Arc::new(Self {
            name: name.into(),
            id: next_instance_id(),
            state,
            stopped: AtomicBool::new(false),
            embedded: Mutex::new(Embedded::default()),
            stop_timeout,
            registry,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub(crate) fn invalid(&self, operation: &'static str) -> HarnessError {
        HarnessError::InvalidState {
            service: self.name.clone(),
            state: self.state().to_string(),
            operation,
        }
    }

    /*
        @@@
        @begin_start();
        . Moves Created -> Starting atomically; any other state is an InvalidState error.
        . Registers the teardown hook before anything is spawned, so host shutdown always cleans up.
    */
    pub(crate) fn begin_start(self: &Arc<Self>) -> Result<()> {
        let moved = self.state.send_if_modified(|state| {
            if *state == LifecycleState::Created && !self.stopped.load(Ordering::SeqCst) {
                *state = LifecycleState::Starting;
                true
            } else {
                false
            }
        });
        if !moved {
            return Err(self.invalid("start"));
        }
        self.registry.register(self.id, self);
        Ok(())
    }

    pub(crate) fn mark_running(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == LifecycleState::Starting {
                *state = LifecycleState::Running;
                true
            } else {
                false
            }
        })
    }

    /*
        @@@
        @launch();
        . Refuses once stop() has begun; the data directory is released instead of kept.
        . Keeps the data directory before spawning, so a failed spawn still gets it cleaned on stop.
        . Spawns the process, attaches a LogWatcher to its stdout with `tokens` and stores both.
    */
    pub(crate) async fn launch(
        &self,
        data_dir: ResolvedDataDir,
        spec: SpawnSpec,
        tokens: &[&str],
    ) -> Result<Arc<LogWatcher>> {
        let mut embedded = self.embedded.lock().await;
        // shutdown() raises `stopped` before it takes this lock
        if self.stopped.load(Ordering::SeqCst) {
            drop(embedded);
            data_dir.release(&self.name);
            return Err(self.invalid("launch after stop"));
        }
        if embedded.process.is_some() {
            return Err(self.invalid("launch a second process"));
        }
        embedded.data_dir = Some(data_dir);

        let mut process = spawn_process(&spec).await?;
        let stdout = process.take_stdout().ok_or_else(|| HarnessError::ProcessLaunch {
            program: spec.program.display().to_string(),
            reason: "stdout was not captured".into(),
        })?;
        let output = Arc::new(LogWatcher::attach(self.name.clone(), stdout, tokens));
        embedded.process = Some(process);
        embedded.output = Some(output.clone());
        Ok(output)
    }

    pub(crate) async fn data_dir(&self) -> Option<PathBuf> {
        self.embedded
            .lock()
            .await
            .data_dir
            .as_ref()
            .map(|d| d.path().to_path_buf())
    }

    pub(crate) async fn pid(&self) -> Option<u32> {
        self.embedded
            .lock()
            .await
            .process
            .as_ref()
            .and_then(EmbeddedProcess::pid)
    }

    pub(crate) async fn recent_output(&self) -> Vec<String> {
        match &self.embedded.lock().await.output {
            Some(output) => output.recent_lines(),
            None => Vec::new(),
        }
    }

    /*
        @@@
        @shutdown();
        . One-shot: the first caller flips `stopped`, later and concurrent callers return at once.
        . Terminates the process, then releases the data directory; both best-effort, errors only logged.
        . Leaves the registry and ends in Stopped.
    */
    pub(crate) async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!(service = %self.name, "Already stopped");
            return;
        }
        info!(service = %self.name, "Shutting down embedded service...");

        let mut embedded = self.embedded.lock().await;
        if let Some(mut process) = embedded.process.take() {
            if let Err(e) = process.terminate(self.stop_timeout).await {
                error!(service = %self.name, error = %e, "Failed to terminate process");
            }
        }
        embedded.output = None;
        if let Some(dir) = embedded.data_dir.take() {
            dir.release(&self.name);
        }
        drop(embedded);

        self.registry.deregister(self.id);
        self.state.send_replace(LifecycleState::Stopped);
    }
}

/// Last resort for a controller dropped without stop(): kill the child and
/// remove an owned data directory without waiting.
impl Drop for ServiceCore {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let embedded = self.embedded.get_mut();
        if let Some(process) = embedded.process.as_mut() {
            warn!(service = %self.name, pid = ?process.pid(), "Dropped without stop(), killing process");
            process.start_kill();
        }
        embedded.output = None;
        if let Some(dir) = embedded.data_dir.take() {
            dir.release(&self.name);
        }
    }
}

#[async_trait]
impl Teardown for ServiceCore {
    fn describe(&self) -> String {
        format!("{} (instance {})", self.name, self.id)
    }

    async fn teardown(&self) {
        if self.state() != LifecycleState::Stopped {
            warn!(service = %self.name, "Tearing down service that was never stopped");
        }
        self.shutdown().await;
    }
}
