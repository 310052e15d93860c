use crate::error::{HarnessError, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn, Instrument};

/// How long a freshly spawned server gets to prove it did not die on launch.
pub const DEFAULT_LAUNCH_PROBE: Duration = Duration::from_millis(200);

/// Everything needed to launch one subordinate process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub workingdir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub launch_probe: Duration,
}

impl SpawnSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            workingdir: None,
            env: HashMap::new(),
            launch_probe: DEFAULT_LAUNCH_PROBE,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn workingdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workingdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn launch_probe(mut self, probe: Duration) -> Self {
        self.launch_probe = probe;
        self
    }
}

/// A live child process owned by exactly one controller.
///
/// The child is killed if the handle is dropped while it still runs.
pub struct EmbeddedProcess {
    name: String,
    pid: Option<u32>,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr_drain: Option<JoinHandle<()>>,
}






/*
    @@@
    @spawn_process();
    . Launches `spec.program` with piped stdout/stderr, null stdin and kill-on-drop.
    . Drains stderr on a background task, re-emitting every line as a WARN event.
    . Watches the child for `launch_probe`; a non-zero exit inside that window is a launch failure.
*/
pub async fn spawn_process(spec: &SpawnSpec) -> Result<EmbeddedProcess> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.workingdir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| HarnessError::ProcessLaunch {
        program: spec.program.display().to_string(),
        reason: e.to_string(),
    })?;
    let pid = child.id();
    info!(process = %spec.name, pid, program = %spec.program.display(), args = ?spec.args, "Spawned embedded process");

    let stdout = child.stdout.take();
    let stderr_drain = child.stderr.take().map(|stderr| {
        let name = spec.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(process = %name, "{}", line);
            }
        }.in_current_span())
    });

    let mut process = EmbeddedProcess {
        name: spec.name.clone(),
        pid,
        child,
        stdout,
        stderr_drain,
    };

    if !spec.launch_probe.is_zero() {
        if let Some(status) = process.wait_timeout(spec.launch_probe).await? {
            if !status.success() {
                return Err(HarnessError::ProcessLaunch {
                    program: spec.program.display().to_string(),
                    reason: format!("exited during launch with {status}"),
                });
            }
            debug!(process = %spec.name, "Exited cleanly during launch probe");
        }
    }

    Ok(process)
}

impl EmbeddedProcess {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Hands out the stdout pipe; only the first call gets it.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    /// Returns `None` when the process is still alive after `limit`.
    pub async fn wait_timeout(&mut self, limit: Duration) -> Result<Option<ExitStatus>> {
        match timeout(limit, self.child.wait()).await {
            Ok(status) => Ok(Some(status?)),
            Err(_) => Ok(None),
        }
    }

    /*
        @@@
        @terminate();
        . Sends SIGTERM and waits up to `grace` for the process to exit.
        . Escalates to SIGKILL once the grace period runs out.
        . A process that has already exited is left alone.
    */
    pub async fn terminate(&mut self, grace: Duration) -> Result<()> {
        if let Some(status) = self.child.try_wait()? {
            debug!(process = %self.name, exit_code = ?status.code(), "Already exited");
            return self.finish_drain().await;
        }

        if let Some(pid) = self.pid {
            info!(process = %self.name, pid, signal = ?Signal::SIGTERM, "sending stop signal");
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => error!(process = %self.name, error = %e, "failed to send SIGTERM"),
            }
        }

        match self.wait_timeout(grace).await? {
            Some(status) => {
                info!(process = %self.name, exit_code = ?status.code(), "exited cleanly");
            }
            None => {
                self.child.kill().await?;
                warn!(process = %self.name, grace = ?grace, "sent SIGKILL after timeout");
            }
        }
        self.finish_drain().await
    }

    /// Sends SIGKILL without waiting; for paths that cannot await.
    pub fn start_kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(process = %self.name, error = %e, "kill on drop failed");
        }
    }

    async fn finish_drain(&mut self) -> Result<()> {
        if let Some(drain) = self.stderr_drain.take() {
            let _ = timeout(Duration::from_secs(1), drain).await;
        }
        Ok(())
    }
}
