//! Local subprocess dispatcher - runs commands through a shell on this host

use crate::dispatch::{DispatchError, DispatchOutput, DispatchRequest, RemoteDispatch};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Configuration for the local dispatcher
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Shell used to interpret command text (`<shell> -c <command>`)
    pub shell: String,

    /// Endpoints this dispatcher accepts. Empty accepts any name.
    pub endpoints: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".to_string(),
            endpoints: Vec::new(),
        }
    }
}

impl DispatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }
}

/// Runs each request as a child process of this one
#[derive(Debug, Clone, Default)]
pub struct LocalDispatch {
    config: DispatchConfig,
}

impl LocalDispatch {
    pub fn new(config: DispatchConfig) -> Self {
        Self { config }
    }

    fn check_endpoint(&self, request: &DispatchRequest) -> Result<(), DispatchError> {
        match &request.endpoint {
            Some(name) if !self.config.endpoints.is_empty() && !self.config.endpoints.contains(name) => {
                Err(DispatchError::Endpoint(format!("unknown compute endpoint '{}'", name)))
            }
            _ => Ok(()),
        }
    }
}

/// The process group of one spawned shell. Dropping it kills every member,
/// so tools the shell forked do not outlive a timeout or a cancelled dispatch.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }

    /// The shell exited on its own; leave the group alone
    fn release(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg only sends a signal. A group that is already gone yields ESRCH.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!("killpg({}) failed: {}", pgid, std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

#[async_trait]
impl RemoteDispatch for LocalDispatch {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchOutput, DispatchError> {
        self.check_endpoint(request)?;

        debug!(
            "Spawning `{}` in {} (wait bound {}s)",
            request.command,
            request.working_dir.display(),
            request.wait_bound.as_secs()
        );

        let started = Instant::now();

        let mut command = Command::new(&self.config.shell);
        command
            .arg("-c")
            .arg(&request.command)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The shell leads a new group so everything it starts can be killed together
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            DispatchError::Spawn(format!(
                "{} in {}: {}",
                self.config.shell,
                request.working_dir.display(),
                e
            ))
        })?;
        let mut group = ProcessGroup { pgid: child.id() };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let finished = timeout(request.wait_bound, async {
            tokio::try_join!(child.wait(), read_pipe(stdout), read_pipe(stderr))
        })
        .await;

        let (status, stdout, stderr) = match finished {
            Ok(result) => result.map_err(|e| DispatchError::Wait(format!("`{}`: {}", request.command, e)))?,
            Err(_) => {
                warn!(
                    "`{}` exceeded {}s; killing its process group",
                    request.command,
                    request.wait_bound.as_secs()
                );
                group.kill();
                if let Err(e) = child.wait().await {
                    debug!("Reaping `{}` failed: {}", request.command, e);
                }
                return Err(DispatchError::Timeout(request.wait_bound));
            }
        };
        group.release();

        let exit_code = status.code();
        if exit_code != Some(0) {
            warn!(
                "`{}` exited with {:?}",
                request.command,
                exit_code
            );
        }

        Ok(DispatchOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            elapsed: started.elapsed(),
        })
    }
}
