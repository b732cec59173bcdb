use std::{
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{ChildStdout, Command},
    sync::oneshot,
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    compile::toolchain::{kill_process_group, read_limited},
    config::SandboxConfig,
};

const TRUNCATION_MARKER: &str = "[output truncated]\n";
const MAX_RUNTIME_STDERR: usize = 16 * 1024;

/// Evaluates the loader inside a fresh `vm` context and reports back over
/// stdout as JSON lines.
///
/// The context global is backed by a null-prototype object, and every global
/// the loader sees is created inside the context by `installSandbox`. Host
/// functions only reach it as closure captures; they take and return
/// primitives and never throw. The runtime itself must run under its
/// permission model, otherwise the harness refuses the run.
const NODE_HARNESS: &str = r#"'use strict';
const vm = require('vm');
const factoryName = process.env.SANDBOX_FACTORY || 'createCppWasmModule';
const send = (msg) => process.stdout.write(JSON.stringify(msg) + '\n');
const finish = (code) => process.stdout.write('', () => process.exit(code));
const describe = (err) => {
  try {
    return String((err && err.message) || err);
  } catch (_) {
    return 'unknown error';
  }
};

let settled = false;
const settle = (type, message) => {
  if (settled) return;
  settled = true;
  if (type === 'done') {
    send({ type: 'done' });
    finish(0);
  } else if (type === 'missing_factory') {
    send({ type: 'missing_factory' });
    finish(1);
  } else {
    send({ type: 'error', message: typeof message === 'string' ? message : 'unknown error' });
    finish(1);
  }
};
const emit = (type, text) => {
  if (settled || typeof text !== 'string') return;
  send({ type: type === 'stderr' ? 'stderr' : 'stdout', text });
};
const timers = new Map();
let nextTimer = 1;
const schedule = (callback, ms) => {
  if (typeof callback !== 'function') return 0;
  const id = nextTimer++;
  const delay = typeof ms === 'number' && ms > 0 ? ms : 0;
  timers.set(id, setTimeout(() => {
    timers.delete(id);
    callback();
  }, delay));
  return id;
};
const cancel = (id) => {
  clearTimeout(timers.get(id));
  timers.delete(id);
};
const now = () => performance.now();

function installSandbox(emit, settle, schedule, cancel, now) {
  'use strict';
  const g = globalThis;
  const describe = (err) => {
    try {
      return String((err && err.message) || err);
    } catch (_) {
      return 'unknown error';
    }
  };
  const fail = (err) => settle('error', describe(err));
  const join = (args) => {
    let text = '';
    for (let i = 0; i < args.length; i++) {
      text += (i ? ' ' : '') + String(args[i]);
    }
    return text;
  };
  const print = (...args) => emit('stdout', join(args));
  const printErr = (...args) => emit('stderr', join(args));
  const invoke = (fn, args) => {
    try {
      fn(...args);
    } catch (err) {
      fail(err);
    }
  };
  const alphabet = 'ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/';

  g.window = g;
  g.self = g;
  g.location = { href: 'file:///sandbox/loader.js' };
  g.console = { log: print, info: print, debug: print, warn: printErr, error: printErr };
  g.performance = { now: () => now() };
  g.setTimeout = (fn, ms, ...args) =>
    typeof fn === 'function' ? schedule(() => invoke(fn, args), +ms || 0) : 0;
  g.clearTimeout = (id) => cancel(+id || 0);
  g.atob = (input) => {
    const clean = String(input).replace(/[\s=]/g, '');
    let out = '';
    let buffer = 0;
    let bits = 0;
    for (let i = 0; i < clean.length; i++) {
      const value = alphabet.indexOf(clean[i]);
      if (value < 0) throw new Error('invalid base64 input');
      buffer = ((buffer << 6) | value) & 0xffffff;
      bits += 6;
      if (bits >= 8) {
        bits -= 8;
        out += String.fromCharCode((buffer >> bits) & 0xff);
      }
    }
    return out;
  };

  return (name) => {
    const factory = g[name];
    if (typeof factory !== 'function') {
      settle('missing_factory', '');
      return;
    }
    Promise.resolve()
      .then(() => factory({ print, printErr }))
      .then(() => settle('done', ''), fail);
  };
}

function run() {
  let source = '';
  process.stdin.setEncoding('utf8');
  process.stdin.on('data', (chunk) => { source += chunk; });
  process.stdin.on('end', () => {
    const context = vm.createContext(Object.create(null));
    let start;
    try {
      const install = vm.runInContext('(' + installSandbox.toString() + ')', context, {
        filename: 'sandbox.js',
      });
      start = install(emit, settle, schedule, cancel, now);
      vm.runInContext(source, context, { filename: 'loader.js' });
    } catch (err) {
      settle('error', describe(err));
      return;
    }
    start(factoryName);
  });
}

const permission = process.permission;
if (!permission || permission.has('child') || permission.has('worker') || permission.has('fs.write')) {
  send({ type: 'error', message: 'sandbox runtime started without its permission model' });
  finish(1);
} else {
  run();
}
"#;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("loader script does not expose factory function `{0}`")]
    LoaderContractViolation(String),
    #[error("{0}")]
    ModuleExecution(String),
    #[error("no completion signal within {}ms", .0.as_millis())]
    ExecutionTimeout(Duration),
    #[error("sandbox runtime unavailable: {0}")]
    Runtime(String),
}

/// Messages the isolated context sends across the boundary, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxMessage {
    Stdout { text: String },
    Stderr { text: String },
    Done,
    Error { message: String },
    MissingFactory,
}

#[derive(Debug)]
enum Signal {
    Completed { output: String },
    Failed { message: String },
    MissingFactory,
    Exited { stderr: String },
}

#[async_trait]
pub trait ExecutionSandbox: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, loader: String, timeout: Duration) -> Result<String, SandboxError>;
}

/// Pending completion listeners, keyed by run. Each entry is removed exactly
/// once, by whichever of resolve or deregister gets there first.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    pending: DashMap<Uuid, oneshot::Sender<Signal>>,
}

impl ListenerRegistry {
    fn register(&self, id: Uuid) -> oneshot::Receiver<Signal> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        rx
    }

    fn resolve(&self, id: Uuid, signal: Signal) -> bool {
        match self.pending.remove(&id) {
            Some((_, tx)) => tx.send(signal).is_ok(),
            None => false,
        }
    }

    fn deregister(&self, id: Uuid) -> bool {
        self.pending.remove(&id).is_some()
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Runs every loader in its own short-lived runtime process.
pub struct ProcessSandbox {
    program: PathBuf,
    args: Vec<String>,
    factory_name: String,
    max_output_bytes: usize,
    listeners: Arc<ListenerRegistry>,
}

impl ProcessSandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        let args = config.args.clone().unwrap_or_else(|| {
            let mut args = config.runtime_flags.clone();
            args.extend(["-e".to_string(), NODE_HARNESS.to_string()]);
            args
        });
        Self {
            program: config.program.clone(),
            args,
            factory_name: config.factory_name.clone(),
            max_output_bytes: config.max_output_bytes,
            listeners: Arc::new(ListenerRegistry::default()),
        }
    }

    #[cfg(test)]
    pub fn listeners(&self) -> Arc<ListenerRegistry> {
        self.listeners.clone()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env_clear()
            .env("SANDBOX_FACTORY", &self.factory_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        cmd
    }
}

#[async_trait]
impl ExecutionSandbox for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn run(&self, loader: String, timeout: Duration) -> Result<String, SandboxError> {
        let run_id = Uuid::new_v4();
        let listener = self.listeners.register(run_id);

        let mut child = match self.command().spawn() {
            Ok(child) => child,
            Err(err) => {
                self.listeners.deregister(run_id);
                return Err(SandboxError::Runtime(format!(
                    "failed to start {}: {err}",
                    self.program.display()
                )));
            }
        };
        let started = Instant::now();
        let pid = child.id();
        tracing::debug!(%run_id, pid, "sandbox runtime started");

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                let _ = stdin.write_all(loader.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            self.listeners.deregister(run_id);
            let _ = child.kill().await;
            return Err(SandboxError::Runtime("runtime pipes unavailable".to_string()));
        };
        let stderr_task = tokio::spawn(async move {
            let bytes = read_limited(Some(stderr), MAX_RUNTIME_STDERR).await;
            String::from_utf8_lossy(&bytes).trim_end().to_string()
        });
        let pump = spawn_message_pump(
            run_id,
            stdout,
            stderr_task,
            self.listeners.clone(),
            self.max_output_bytes,
        );

        let outcome = tokio::time::timeout(timeout, listener).await;
        if outcome.is_err() {
            kill_process_group(pid).await;
        }
        let _ = child.kill().await;

        let signal = match outcome {
            Ok(Ok(signal)) => signal,
            Ok(Err(_)) => {
                pump.abort();
                return Err(SandboxError::Runtime(
                    "runtime closed the channel without a signal".to_string(),
                ));
            }
            Err(_) => {
                self.listeners.deregister(run_id);
                pump.abort();
                tracing::warn!(%run_id, timeout_ms = timeout.as_millis() as u64, "sandbox timed out");
                return Err(SandboxError::ExecutionTimeout(timeout));
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match signal {
            Signal::Completed { output } => {
                tracing::debug!(%run_id, elapsed_ms, "sandbox completed");
                Ok(output)
            }
            Signal::Failed { message } => Err(SandboxError::ModuleExecution(message)),
            Signal::MissingFactory => Err(SandboxError::LoaderContractViolation(
                self.factory_name.clone(),
            )),
            Signal::Exited { stderr } => {
                let message = if stderr.is_empty() {
                    "sandboxed module exited without signalling completion".to_string()
                } else {
                    stderr
                };
                Err(SandboxError::ModuleExecution(message))
            }
        }
    }
}

fn spawn_message_pump(
    run_id: Uuid,
    stdout: ChildStdout,
    stderr_task: JoinHandle<String>,
    listeners: Arc<ListenerRegistry>,
    max_output_bytes: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut output = OutputBuffer::new(max_output_bytes);
        let mut lines = BufReader::new(stdout).lines();

        let signal = loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => {
                    let stderr = stderr_task.await.unwrap_or_default();
                    break Signal::Exited { stderr };
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SandboxMessage>(&line) {
                Ok(SandboxMessage::Stdout { text }) | Ok(SandboxMessage::Stderr { text }) => {
                    output.push(&text);
                }
                Ok(SandboxMessage::Done) => {
                    break Signal::Completed {
                        output: output.into_string(),
                    };
                }
                Ok(SandboxMessage::Error { message }) => break Signal::Failed { message },
                Ok(SandboxMessage::MissingFactory) => break Signal::MissingFactory,
                Err(_) => {
                    tracing::debug!(%run_id, "ignoring non-protocol line from sandbox runtime");
                }
            }
        };

        if !listeners.resolve(run_id, signal) {
            tracing::debug!(%run_id, "late sandbox signal dropped; run already finished");
        }
    })
}

/// Every chunk is followed by a newline, in arrival order.
struct OutputBuffer {
    text: String,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &str) {
        if self.truncated {
            return;
        }
        if self.text.len() + chunk.len() + 1 > self.limit {
            self.truncated = true;
            self.text.push_str(TRUNCATION_MARKER);
            return;
        }
        self.text.push_str(chunk);
        self.text.push('\n');
    }

    fn into_string(self) -> String {
        self.text
    }
}
