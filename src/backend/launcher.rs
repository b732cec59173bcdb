use std::{io, path::PathBuf, process::Stdio};

use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    task::JoinHandle,
};

use crate::{compile::toolchain::kill_process_group, config::LaunchMode};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to start backend {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub struct ServerLauncher {
    mode: LaunchMode,
}

/// The running backend process. Whoever holds this is the only party allowed
/// to stop it, through [`ServerProcessHandle::terminate`].
pub struct ServerProcessHandle {
    child: Child,
    pid: Option<u32>,
    readers: Vec<JoinHandle<()>>,
}

impl ServerLauncher {
    pub fn new(mode: LaunchMode) -> Self {
        Self { mode }
    }

    /// Returns `Ok(None)` when the launch preconditions do not hold; that is
    /// logged, not treated as fatal, since the backend may already be running.
    pub fn start(&self) -> Result<Option<ServerProcessHandle>, LaunchError> {
        let (program, mut cmd) = match &self.mode {
            LaunchMode::Packaged { executable } => {
                if !executable.is_file() {
                    tracing::warn!(
                        executable = %executable.display(),
                        "bundled backend executable not found; launch skipped"
                    );
                    return Ok(None);
                }
                tracing::info!(executable = %executable.display(), "starting bundled backend");
                (executable.clone(), Command::new(executable))
            }
            LaunchMode::Development {
                interpreter,
                working_dir,
                args,
            } => {
                if !interpreter.exists() {
                    tracing::warn!(
                        interpreter = %interpreter.display(),
                        "backend interpreter not found; launch skipped"
                    );
                    return Ok(None);
                }
                tracing::info!(
                    interpreter = %interpreter.display(),
                    dir = %working_dir.display(),
                    ?args,
                    "starting development backend"
                );
                let mut cmd = Command::new(interpreter);
                cmd.args(args).current_dir(working_dir);
                (interpreter.clone(), cmd)
            }
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Bundled executables fork the real server; a group of its own lets
        // teardown reach those descendants too.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|source| LaunchError::Spawn { program, source })?;
        let pid = child.id();
        tracing::info!(pid, "backend process started");

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_stream_reader(stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_stream_reader(stderr, true));
        }

        Ok(Some(ServerProcessHandle {
            child,
            pid,
            readers,
        }))
    }
}

impl ServerProcessHandle {
    #[cfg(test)]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub async fn terminate(mut self) {
        let alive = self.is_alive();
        // The leader may already be gone while forked workers still hold the port.
        kill_process_group(self.pid).await;
        if alive {
            tracing::info!(pid = self.pid, "stopping backend process");
            if let Err(err) = self.child.kill().await {
                tracing::warn!(pid = self.pid, error = %err, "failed to kill backend process");
            }
        } else {
            let status = self.child.try_wait().ok().flatten();
            tracing::info!(pid = self.pid, ?status, "backend process already exited");
        }
        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }
}

fn spawn_stream_reader<R>(stream: R, is_stderr: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                tracing::warn!(target: "backend", "{line}");
            } else {
                tracing::info!(target: "backend", "{line}");
            }
        }
    })
}
