use anyhow::{Context, Result};
use std::{
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

const DEFAULT_TOOLCHAIN_ROOT: &str = "/opt/emsdk";
const DEFAULT_FACTORY: &str = "createCppWasmModule";
pub const DEFAULT_RUNTIME_FLAGS: &[&str] = &["--permission", "--disallow-code-generation-from-strings"];

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub bind_addr: SocketAddr,
    pub log_level: String,
    pub log_format: LogFormat,
    pub compile: CompileConfig,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct CompileConfig {
    pub work_dir: PathBuf,
    /// Resolved once at startup. `Err` holds the reason the compiler could not be found.
    pub toolchain: Result<ToolchainConfig, String>,
    pub sandbox: SandboxConfig,
    pub max_source_bytes: usize,
    pub worker_count: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct ToolchainConfig {
    pub program: PathBuf,
    /// Inserted before the source path.
    pub leading_args: Vec<String>,
    /// Appended after the standard output-format flags.
    pub extra_args: Vec<String>,
    pub factory_name: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub program: PathBuf,
    /// `None` runs the built-in harness.
    pub args: Option<Vec<String>>,
    /// Runtime flags placed before the built-in harness. The harness refuses
    /// to run unless they enable the runtime's permission model.
    pub runtime_flags: Vec<String>,
    pub factory_name: String,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone)]
pub enum LaunchMode {
    Packaged {
        executable: PathBuf,
    },
    Development {
        interpreter: PathBuf,
        working_dir: PathBuf,
        args: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub launch: LaunchMode,
    pub base_url: String,
    pub health_path: String,
    pub readiness: ReadinessConfig,
}

impl BackendConfig {
    pub fn health_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.health_path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    pub interval: Duration,
    /// `None` keeps probing until stopped.
    pub max_attempts: Option<u32>,
    pub probe_timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: Some(60),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

impl HostConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8888".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let log_format = match env::var("LOG_FORMAT")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            _ => LogFormat::Compact,
        };

        let factory_name =
            env::var("SANDBOX_FACTORY").unwrap_or_else(|_| DEFAULT_FACTORY.to_string());

        let toolchain = resolve_compiler().map(|program| ToolchainConfig {
            program,
            leading_args: Vec::new(),
            extra_args: parse_csv("TOOLCHAIN_EXTRA_ARGS", ""),
            factory_name: factory_name.clone(),
            timeout: Duration::from_millis(parse_env("COMPILE_TIMEOUT_MS", 20_000u64)),
        });

        let sandbox = SandboxConfig {
            program: PathBuf::from(env::var("SANDBOX_RUNTIME").unwrap_or_else(|_| "node".into())),
            args: None,
            runtime_flags: parse_csv("SANDBOX_RUNTIME_FLAGS", &DEFAULT_RUNTIME_FLAGS.join(",")),
            factory_name,
            timeout: Duration::from_millis(parse_env("SANDBOX_TIMEOUT_MS", 5_000u64)),
            max_output_bytes: parse_env("MAX_OUTPUT_BYTES", 64 * 1024usize),
        };

        let compile = CompileConfig {
            work_dir: env::var("COMPILE_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir().join("cpp_executions")),
            toolchain,
            sandbox,
            max_source_bytes: parse_env("MAX_SOURCE_BYTES", 250_000usize),
            worker_count: parse_env("WORKER_COUNT", 2usize).max(1),
            queue_capacity: parse_env("QUEUE_CAPACITY", 16usize).max(1),
        };

        let launch = if parse_env("APP_PACKAGED", false) {
            LaunchMode::Packaged {
                executable: env::var("BACKEND_EXECUTABLE")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("resources/rag-engine/rag-engine")),
            }
        } else {
            LaunchMode::Development {
                interpreter: env::var("BACKEND_INTERPRETER")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("rag-engine/.venv/bin/python")),
                working_dir: env::var("BACKEND_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("rag-engine")),
                args: parse_csv(
                    "BACKEND_ARGS",
                    "-m,uvicorn,main:app,--host,127.0.0.1,--port,8000",
                ),
            }
        };

        let max_attempts = match parse_env("READINESS_MAX_ATTEMPTS", 60u32) {
            0 => None,
            n => Some(n),
        };

        let backend = BackendConfig {
            launch,
            base_url: env::var("BACKEND_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8000".to_string())
                .trim_end_matches('/')
                .to_string(),
            health_path: env::var("HEALTH_PATH").unwrap_or_else(|_| "/health".to_string()),
            readiness: ReadinessConfig {
                interval: Duration::from_millis(parse_env("READINESS_INTERVAL_MS", 1_000u64).max(10)),
                max_attempts,
                probe_timeout: Duration::from_millis(parse_env("PROBE_TIMEOUT_MS", 2_000u64)),
            },
        };

        Ok(Self {
            bind_addr,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,
            compile,
            backend,
        })
    }
}

/// `EMCC_PATH` wins, then `<EMSDK|TOOLCHAIN_ROOT>/upstream/emscripten/emcc`,
/// then the fixed install location.
fn resolve_compiler() -> Result<PathBuf, String> {
    if let Ok(explicit) = env::var("EMCC_PATH") {
        let path = PathBuf::from(explicit);
        return if path.is_file() {
            Ok(path)
        } else {
            Err(format!("EMCC_PATH points to a missing file: {}", path.display()))
        };
    }

    let root = env::var("EMSDK")
        .or_else(|_| env::var("TOOLCHAIN_ROOT"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_TOOLCHAIN_ROOT));
    compiler_under_root(&root)
}

fn compiler_under_root(root: &Path) -> Result<PathBuf, String> {
    let candidate = root.join("upstream").join("emscripten").join("emcc");
    if candidate.is_file() {
        Ok(candidate)
    } else {
        Err(format!(
            "emscripten compiler not found under toolchain root {} (set EMSDK, TOOLCHAIN_ROOT or EMCC_PATH)",
            root.display()
        ))
    }
}

fn parse_csv(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}
