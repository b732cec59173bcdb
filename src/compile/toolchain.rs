use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio::{io::AsyncReadExt, process::Command};

use crate::config::ToolchainConfig;

const MAX_DIAGNOSTIC_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("{stderr}")]
    Failed { stderr: String, exit_code: Option<i32> },
    #[error("compiler timed out after {}ms\n{stderr}", .timeout.as_millis())]
    TimedOut { stderr: String, timeout: Duration },
    #[error("compiler reported success but produced no artifact at {0}")]
    MissingOutput(PathBuf),
    #[error("failed to start compiler {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Drives one external compiler process per call. Never retries.
#[derive(Debug, Clone)]
pub struct ToolchainInvoker {
    config: ToolchainConfig,
}

impl ToolchainInvoker {
    pub fn new(config: ToolchainConfig) -> Self {
        Self { config }
    }

    pub async fn compile(&self, source: &Path, output: &Path) -> Result<(), ToolchainError> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.leading_args)
            .arg(source)
            .arg("-o")
            .arg(output)
            .args(self.format_args())
            .args(&self.config.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ToolchainError::Spawn {
            program: self.config.program.clone(),
            source,
        })?;
        let pid = child.id();
        tracing::info!(pid, source = %source.display(), "compiler started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(read_limited(stdout, MAX_DIAGNOSTIC_BYTES));
        let stderr_task = tokio::spawn(read_limited(stderr, MAX_DIAGNOSTIC_BYTES));

        let waited = tokio::time::timeout(self.config.timeout, child.wait()).await;
        let status = match waited {
            Ok(Ok(status)) => Some(status),
            Ok(Err(err)) => {
                return Err(ToolchainError::Spawn {
                    program: self.config.program.clone(),
                    source: err,
                });
            }
            Err(_) => {
                kill_process_group(pid).await;
                let _ = child.kill().await;
                None
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let stderr = String::from_utf8_lossy(&stderr).trim_end().to_string();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let Some(status) = status else {
            tracing::warn!(pid, elapsed_ms, "compiler timed out; process group killed");
            return Err(ToolchainError::TimedOut {
                stderr,
                timeout: self.config.timeout,
            });
        };

        if !status.success() {
            tracing::info!(pid, exit_code = ?status.code(), elapsed_ms, "compiler rejected source");
            // Some toolchains print diagnostics on stdout only.
            let stderr = if stderr.is_empty() {
                String::from_utf8_lossy(&stdout).trim_end().to_string()
            } else {
                stderr
            };
            return Err(ToolchainError::Failed {
                stderr,
                exit_code: status.code(),
            });
        }

        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            tracing::error!(pid, output = %output.display(), "compiler exited 0 without an artifact");
            return Err(ToolchainError::MissingOutput(output.to_path_buf()));
        }

        tracing::info!(pid, elapsed_ms, "compiler finished");
        Ok(())
    }

    /// Loader format expected by the sandbox: one self-contained script that
    /// exposes the configured factory function.
    fn format_args(&self) -> Vec<String> {
        vec![
            "-sMODULARIZE=1".to_string(),
            format!("-sEXPORT_NAME={}", self.config.factory_name),
            "-sENVIRONMENT=web".to_string(),
            "-sSINGLE_FILE=1".to_string(),
        ]
    }
}

/// Kills every process in the group led by `pid`, including children the
/// leader forked and left running.
#[cfg(unix)]
pub(crate) async fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    let killed = Command::new("kill")
        .args(["-s", "KILL", "--"])
        .arg(format!("-{pid}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(err) = killed {
        tracing::warn!(pid, error = %err, "failed to signal process group");
    }
}

#[cfg(not(unix))]
pub(crate) async fn kill_process_group(_pid: Option<u32>) {}

pub(crate) async fn read_limited<R>(reader: Option<R>, limit: usize) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(limit.min(8192));
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if out.len() < limit {
                    let remaining = limit - out.len();
                    out.extend_from_slice(&chunk[..remaining.min(n)]);
                }
            }
            Err(_) => break,
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// A compiler stand-in: `sh -c <script> fake-emcc <source> -o <output> ...`.
    pub(crate) fn fake_compiler(script: &str, timeout: Duration) -> ToolchainConfig {
        ToolchainConfig {
            program: PathBuf::from("/bin/sh"),
            leading_args: vec!["-c".to_string(), script.to_string(), "fake-emcc".to_string()],
            extra_args: Vec::new(),
            factory_name: "createCppWasmModule".to_string(),
            timeout,
        }
    }

    /// Zombies count as gone; they only wait to be reaped.
    pub(crate) fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .is_some_and(|state| state != 'Z' && state != 'X'),
            Err(_) => false,
        }
    }

    pub(crate) async fn wait_until_gone(pid: u32) -> bool {
        for _ in 0..100 {
            if !process_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    pub(crate) async fn read_pid_file(path: &Path) -> u32 {
        for _ in 0..100 {
            if let Ok(text) = std::fs::read_to_string(path) {
                if let Ok(pid) = text.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no pid written to {}", path.display());
    }

    fn paths(tmp: &TempDir) -> (PathBuf, PathBuf) {
        let source = tmp.path().join("main.cpp");
        std::fs::write(&source, "int main() {}").unwrap();
        (source, tmp.path().join("main.js"))
    }

    #[tokio::test]
    async fn successful_compile_produces_artifact() {
        let tmp = TempDir::new().unwrap();
        let (source, output) = paths(&tmp);
        let invoker = ToolchainInvoker::new(fake_compiler(
            r#"printf 'loader' > "$3""#,
            Duration::from_secs(5),
        ));

        invoker.compile(&source, &output).await.unwrap();
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "loader");
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let tmp = TempDir::new().unwrap();
        let (source, output) = paths(&tmp);
        let invoker = ToolchainInvoker::new(fake_compiler(
            r#"echo "error: expected ';'" >&2; exit 1"#,
            Duration::from_secs(5),
        ));

        match invoker.compile(&source, &output).await {
            Err(ToolchainError::Failed { stderr, exit_code }) => {
                assert_eq!(stderr, "error: expected ';'");
                assert_eq!(exit_code, Some(1));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn success_without_artifact_is_a_contract_violation() {
        let tmp = TempDir::new().unwrap();
        let (source, output) = paths(&tmp);
        let invoker = ToolchainInvoker::new(fake_compiler("exit 0", Duration::from_secs(5)));

        let err = invoker.compile(&source, &output).await.unwrap_err();
        assert!(matches!(err, ToolchainError::MissingOutput(_)));
    }

    #[tokio::test]
    async fn slow_compiler_times_out() {
        let tmp = TempDir::new().unwrap();
        let (source, output) = paths(&tmp);
        let invoker = ToolchainInvoker::new(fake_compiler(
            "echo warming up >&2; sleep 30",
            Duration::from_millis(200),
        ));

        let started = Instant::now();
        let err = invoker.compile(&source, &output).await.unwrap_err();
        assert!(matches!(err, ToolchainError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn timeout_kills_background_children() {
        let tmp = TempDir::new().unwrap();
        let (source, output) = paths(&tmp);
        let invoker = ToolchainInvoker::new(fake_compiler(
            r#"sleep 30 & echo $! > "$3.pid"; wait"#,
            Duration::from_millis(300),
        ));

        let err = invoker.compile(&source, &output).await.unwrap_err();
        assert!(matches!(err, ToolchainError::TimedOut { .. }));

        let pid_file = PathBuf::from(format!("{}.pid", output.display()));
        let background = read_pid_file(&pid_file).await;
        assert!(wait_until_gone(background).await);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let tmp = TempDir::new().unwrap();
        let (source, output) = paths(&tmp);
        let mut config = fake_compiler("", Duration::from_secs(1));
        config.program = tmp.path().join("no-such-emcc");
        config.leading_args.clear();

        let err = ToolchainInvoker::new(config)
            .compile(&source, &output)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolchainError::Spawn { .. }));
    }
}
