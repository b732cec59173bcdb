use std::{sync::Arc, time::Duration};

use crate::{
    compile::{
        artifact::{ArtifactError, ArtifactStore, WorkItem},
        models::{CompileFailure, CompileResult, ErrorKind},
        sandbox::{ExecutionSandbox, ProcessSandbox, SandboxError},
        toolchain::{ToolchainError, ToolchainInvoker},
    },
    config::CompileConfig,
};

/// Sequences prepare → compile → read → execute for one request. One run is
/// exactly one compiler invocation and at most one sandbox execution; the
/// work item is cleaned up on every path.
pub struct CompilePipeline {
    store: ArtifactStore,
    toolchain: Result<ToolchainInvoker, String>,
    sandbox: Arc<dyn ExecutionSandbox>,
    sandbox_timeout: Duration,
    max_source_bytes: usize,
}

impl CompilePipeline {
    pub fn new(
        store: ArtifactStore,
        toolchain: Result<ToolchainInvoker, String>,
        sandbox: Arc<dyn ExecutionSandbox>,
        sandbox_timeout: Duration,
        max_source_bytes: usize,
    ) -> Self {
        Self {
            store,
            toolchain,
            sandbox,
            sandbox_timeout,
            max_source_bytes,
        }
    }

    pub fn from_config(config: &CompileConfig) -> Self {
        Self::new(
            ArtifactStore::new(config.work_dir.clone()),
            config.toolchain.clone().map(ToolchainInvoker::new),
            Arc::new(ProcessSandbox::new(&config.sandbox)),
            config.sandbox.timeout,
            config.max_source_bytes,
        )
    }

    /// `Err` carries the startup-time reason the compiler is unusable.
    pub fn toolchain_status(&self) -> Result<(), &str> {
        self.toolchain.as_ref().map(|_| ()).map_err(String::as_str)
    }

    pub fn sandbox_name(&self) -> &'static str {
        self.sandbox.name()
    }

    /// Compiles without executing and returns the loader script text.
    pub async fn compile_script(&self, source: &str) -> Result<String, CompileFailure> {
        let mut item = self.prepare(source).await?;
        let loader = self.compile_item(&item).await;
        self.store.cleanup(&mut item).await;
        loader
    }

    pub async fn run(&self, source: &str) -> CompileResult {
        let mut item = match self.prepare(source).await {
            Ok(item) => item,
            Err(failure) => return CompileResult::Failure(failure),
        };
        let result = self.execute(&item).await;
        self.store.cleanup(&mut item).await;

        match &result {
            CompileResult::Success { output } => {
                tracing::info!(work_item = %item.id, output_bytes = output.len(), "run succeeded");
            }
            CompileResult::Failure(failure) => {
                tracing::info!(work_item = %item.id, kind = %failure.kind, "run failed");
            }
        }
        result
    }

    async fn prepare(&self, source: &str) -> Result<WorkItem, CompileFailure> {
        if source.trim().is_empty() {
            return Err(CompileFailure::new(
                ErrorKind::EmptyInput,
                "C++ code is required.",
            ));
        }
        if source.len() > self.max_source_bytes {
            return Err(CompileFailure::new(
                ErrorKind::SourceTooLarge,
                format!("source exceeds {} bytes", self.max_source_bytes),
            ));
        }
        if let Err(reason) = &self.toolchain {
            return Err(CompileFailure::new(ErrorKind::ConfigurationError, reason.clone()));
        }

        self.store.prepare(source).await.map_err(|err| {
            tracing::error!(error = %err, root = %self.store.root().display(), "cannot prepare work item");
            CompileFailure::new(ErrorKind::WorkspaceUnavailable, err.to_string())
        })
    }

    async fn compile_item(&self, item: &WorkItem) -> Result<String, CompileFailure> {
        let toolchain = self
            .toolchain
            .as_ref()
            .map_err(|reason| CompileFailure::new(ErrorKind::ConfigurationError, reason.clone()))?;

        toolchain
            .compile(&item.source_path, &item.artifact_path)
            .await
            .map_err(map_toolchain_error)?;

        self.store
            .read_artifact(item)
            .await
            .map_err(|err| match err {
                ArtifactError::Missing(_) => {
                    CompileFailure::new(ErrorKind::ArtifactMissing, err.to_string())
                }
                ArtifactError::Io(io) => CompileFailure::new(
                    ErrorKind::ArtifactMissing,
                    format!("failed to read compiled artifact: {io}"),
                ),
            })
    }

    async fn execute(&self, item: &WorkItem) -> CompileResult {
        let loader = match self.compile_item(item).await {
            Ok(loader) => loader,
            Err(failure) => return CompileResult::Failure(failure),
        };

        match self.sandbox.run(loader, self.sandbox_timeout).await {
            Ok(output) => CompileResult::Success { output },
            Err(err) => CompileResult::Failure(map_sandbox_error(err)),
        }
    }
}

fn map_toolchain_error(err: ToolchainError) -> CompileFailure {
    match err {
        ToolchainError::Failed { stderr, .. } => CompileFailure::new(ErrorKind::CompileError, stderr),
        err @ ToolchainError::TimedOut { .. } => {
            CompileFailure::new(ErrorKind::CompileError, err.to_string())
        }
        err @ ToolchainError::MissingOutput(_) => {
            CompileFailure::new(ErrorKind::ArtifactMissing, err.to_string())
        }
        err @ ToolchainError::Spawn { .. } => {
            CompileFailure::new(ErrorKind::ToolchainContractViolation, err.to_string())
        }
    }
}

fn map_sandbox_error(err: SandboxError) -> CompileFailure {
    let kind = match &err {
        SandboxError::LoaderContractViolation(_) | SandboxError::Runtime(_) => {
            ErrorKind::LoaderContractViolation
        }
        SandboxError::ModuleExecution(_) => ErrorKind::ModuleExecutionError,
        SandboxError::ExecutionTimeout(_) => ErrorKind::ExecutionTimeout,
    };
    CompileFailure::new(kind, err.to_string())
}
