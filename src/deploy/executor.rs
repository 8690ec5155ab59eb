use std::{io, path::PathBuf, process::Stdio, time::Duration};

use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    process::{ChildStderr, ChildStdout, Command},
};
use tracing::{error, info, warn};

use crate::deploy::{DeployRequest, DeployStatus, DeploymentRecord};

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("deploy script not found: {}", .0.display())]
    ScriptNotFound(PathBuf),
    #[error("failed to start deploy script: {0}")]
    Spawn(#[source] io::Error),
    #[error("Deployment script exited with code {0}")]
    NonZeroExit(i32),
    #[error("Deployment script was terminated by a signal")]
    Signaled,
    #[error("Deployment script timed out after {:?}", .0)]
    TimedOut(Duration),
    #[error("failed to wait for deploy script: {0}")]
    Wait(#[source] io::Error),
}

impl DeployError {
    /// `error` when the script never ran to completion on our side, `failed` otherwise.
    pub fn status(&self) -> DeployStatus {
        match self {
            Self::Spawn(_) | Self::Wait(_) => DeployStatus::Error,
            Self::ScriptNotFound(_) | Self::NonZeroExit(_) | Self::Signaled | Self::TimedOut(_) => {
                DeployStatus::Failed
            }
        }
    }
}

/// Runs deploy scripts with `<interpreter> <script>`.
#[derive(Debug, Clone)]
pub struct Executor {
    interpreter: String,
    timeout: Option<Duration>,
}

impl Executor {
    pub fn new(interpreter: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout,
        }
    }

    /// Runs the deploy script of `request` to completion and classifies the outcome. Never
    /// retries.
    pub async fn execute(&self, request: &DeployRequest) -> DeploymentRecord {
        let project = &request.config.project_name;

        let (status, message) = match self.run(request).await {
            Ok(()) => {
                info!("[{}] deployment completed successfully", project);
                (DeployStatus::Success, "Deployment completed".to_owned())
            }
            Err(e) => {
                error!("[{}] deployment failed: {}", project, e);
                (e.status(), e.to_string())
            }
        };

        DeploymentRecord::now(&request.repo_name, &request.branch, status, message)
    }

    async fn run(&self, request: &DeployRequest) -> Result<(), DeployError> {
        let script = &request.config.deploy_script;
        let project = &request.config.project_name;

        // the script may have been removed since startup
        if !tokio::fs::try_exists(script).await.unwrap_or(false) {
            return Err(DeployError::ScriptNotFound(script.clone()));
        }

        info!("[{}] executing script {}", project, script.display());

        let mut command = Command::new(&self.interpreter);
        command
            .arg(script)
            .envs(request.environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // own process group, so a timeout takes down everything the script started
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(DeployError::Spawn)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let finished = {
            let run = async {
                stream_output(project, stdout, stderr).await;
                child.wait().await
            };
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, run).await.ok(),
                None => Some(run.await),
            }
        };

        let status = match finished {
            Some(status) => status.map_err(DeployError::Wait)?,
            None => {
                let limit = self.timeout.unwrap_or_default();
                #[cfg(unix)]
                kill_process_group(child.id());
                if let Err(e) = child.kill().await {
                    warn!("[{}] couldn't kill timed out deploy script: {}", project, e);
                }
                return Err(DeployError::TimedOut(limit));
            }
        };

        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(DeployError::NonZeroExit(code)),
            None => Err(DeployError::Signaled),
        }
    }
}

/// Sends SIGKILL to the process group led by `pid`. Does nothing once the child was reaped.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let pgid = match pid.map(libc::pid_t::try_from) {
        Some(Ok(pgid)) if pgid > 0 => pgid,
        _ => return,
    };

    // SAFETY: kill(2) only takes plain integers. `pgid` is positive, so the negated value
    // addresses exactly the group created for the deploy script at spawn.
    let ret = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if ret != 0 {
        warn!(
            "couldn't kill process group {}: {}",
            pgid,
            io::Error::last_os_error()
        );
    }
}

/// Logs script output line by line as it arrives, until both pipes are closed.
///
/// Lines don't have to be valid UTF-8, invalid bytes are replaced when logging. Both pipes are
/// read until EOF so the script never writes into a closed pipe.
async fn stream_output(project: &str, stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) {
    let mut stdout = stdout.map(BufReader::new);
    let mut stderr = stderr.map(BufReader::new);
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            line = next_line(&mut stdout, &mut stdout_buf), if stdout.is_some() => match line {
                Some(line) => info!(project = %project, "[{}] {}", project, line),
                None => stdout = None,
            },
            line = next_line(&mut stderr, &mut stderr_buf), if stderr.is_some() => match line {
                Some(line) => warn!(project = %project, "[{}] {}", project, line),
                None => stderr = None,
            },
        }
    }
}

/// Reads the next line into `buf`. A line cut short by the other branch of the `select!` stays
/// in `buf` and is completed on the next call.
async fn next_line<R>(reader: &mut Option<R>, buf: &mut Vec<u8>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    let reader = reader.as_mut()?;
    match reader.read_until(b'\n', buf).await {
        Ok(0) if buf.is_empty() => None,
        Ok(_) => {
            let line = String::from_utf8_lossy(buf)
                .trim_end_matches(&['\n', '\r'][..])
                .to_owned();
            buf.clear();
            Some(line)
        }
        Err(e) => {
            warn!("error reading deploy script output: {}", e);
            None
        }
    }
}
