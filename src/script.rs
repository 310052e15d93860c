use crate::error::{HarnessError, Result};
use crate::parse::ClusterEndpoint;
use crate::process::{spawn_process, SpawnSpec};
use crate::watcher::LogWatcher;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Result of a script that ran to completion.
#[derive(Debug, Clone)]
pub struct ScriptOutcome {
    /// Line that contained the completion token, if one was requested.
    pub matched: Option<String>,
    pub exit_code: Option<i32>,
    pub output: Vec<String>,
}

/// Runs script bodies through an interpreter (the `mongo` shell by default).
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    name: String,
    interpreter: PathBuf,
    args: Vec<String>,
    grace: Duration,
}

impl ScriptRunner {
    pub fn new(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            name: "script".into(),
            interpreter: interpreter.into(),
            args: Vec::new(),
            grace: Duration::from_secs(2),
        }
    }

    /// Interpreter pointed at a database node: `--host H --port P` precede the script path.
    pub fn for_endpoint(interpreter: impl Into<PathBuf>, endpoint: &ClusterEndpoint) -> Self {
        Self::new(interpreter).args([
            "--host".to_string(),
            endpoint.host.clone(),
            "--port".to_string(),
            endpoint.port.to_string(),
        ])
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
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

    /*
        @@@
        @run();
        . Writes `body` to a fresh temporary .js file and runs the interpreter on it, stdout watched.
        . With a completion token: waits for the token, then gives the interpreter the rest of the budget to exit.
        . Without one: waits for exit. A non-zero exit is a Provisioning error either way.
        . The script file is removed and a still-running interpreter killed when this returns.
    */
    pub async fn run(
        &self,
        body: &str,
        completion_token: Option<&str>,
        limit: Duration,
    ) -> Result<ScriptOutcome> {
        let mut script = tempfile::Builder::new()
            .prefix("harness-script")
            .suffix(".js")
            .tempfile()?;
        script.write_all(body.as_bytes())?;
        script.flush()?;
        debug!(script = %script.path().display(), bytes = body.len(), "Wrote script file");

        let spec = SpawnSpec::new(self.name.clone(), &self.interpreter)
            .args(self.args.iter().cloned())
            .arg(script.path().display().to_string())
            .launch_probe(Duration::ZERO);

        let started = Instant::now();
        let mut process = spawn_process(&spec).await?;
        let stdout = process.take_stdout().ok_or_else(|| HarnessError::ProcessLaunch {
            program: self.interpreter.display().to_string(),
            reason: "stdout was not captured".into(),
        })?;
        let tokens: Vec<&str> = completion_token.into_iter().collect();
        let watcher = LogWatcher::attach(self.name.clone(), stdout, &tokens);

        let matched = match completion_token {
            Some(token) => match watcher.wait_for(token, limit).await {
                Ok(line) => Some(line),
                Err(e) if watcher.is_closed() => {
                    // output ended without the token; a failing exit explains why
                    if let Some(status) = process.wait_timeout(self.grace).await? {
                        if !status.success() {
                            watcher.drained(Duration::from_secs(1)).await;
                            return Err(HarnessError::Provisioning {
                                code: status.code(),
                                output: watcher.tail(20),
                            });
                        }
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        let remaining = limit.saturating_sub(started.elapsed());
        let exited = process.wait_timeout(remaining).await?;
        if exited.is_some() {
            watcher.drained(Duration::from_secs(1)).await;
        }
        let exit_code = match exited {
            Some(status) if status.success() => status.code(),
            Some(status) => {
                return Err(HarnessError::Provisioning {
                    code: status.code(),
                    output: watcher.tail(20),
                });
            }
            None if matched.is_some() => {
                warn!(process = %self.name, "interpreter still running after completion token, killing it");
                process.terminate(self.grace).await?;
                None
            }
            None => {
                process.terminate(self.grace).await?;
                return Err(HarnessError::ReadinessTimeout {
                    process: self.name.clone(),
                    token: "<exit>".into(),
                    waited: limit,
                    detail: format!("; last output:\n{}", watcher.tail(5)),
                });
            }
        };

        info!(process = %self.name, exit_code = ?exit_code, elapsed = ?started.elapsed(), "Script finished");
        Ok(ScriptOutcome {
            matched,
            exit_code,
            output: watcher.recent_lines(),
        })
    }
}
