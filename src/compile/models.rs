use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body accepted by the compile and run endpoints. `code` is optional on the
/// wire so a missing field can be answered with a 400 instead of a 422.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompileRequest {
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    EmptyInput,
    SourceTooLarge,
    CompileError,
    ToolchainContractViolation,
    ArtifactMissing,
    WorkspaceUnavailable,
    LoaderContractViolation,
    ModuleExecutionError,
    ExecutionTimeout,
    ConfigurationError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyInput => "empty_input",
            Self::SourceTooLarge => "source_too_large",
            Self::CompileError => "compile_error",
            Self::ToolchainContractViolation => "toolchain_contract_violation",
            Self::ArtifactMissing => "artifact_missing",
            Self::WorkspaceUnavailable => "workspace_unavailable",
            Self::LoaderContractViolation => "loader_contract_violation",
            Self::ModuleExecutionError => "module_execution_error",
            Self::ExecutionTimeout => "execution_timeout",
            Self::ConfigurationError => "configuration_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl CompileFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome of one pipeline run. Serialized as
/// `{"success":true,"output":..}` or `{"success":false,"kind":..,"error":..}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileResult {
    Success { output: String },
    Failure(CompileFailure),
}

impl CompileResult {
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failure(CompileFailure::new(kind, message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure(failure) => Some(failure.kind),
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireResult<'a> {
    Success {
        success: bool,
        output: &'a str,
    },
    Failure {
        success: bool,
        kind: ErrorKind,
        error: &'a str,
    },
}

impl Serialize for CompileResult {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let wire = match self {
            Self::Success { output } => WireResult::Success {
                success: true,
                output,
            },
            Self::Failure(failure) => WireResult::Failure {
                success: false,
                kind: failure.kind,
                error: &failure.message,
            },
        };
        wire.serialize(serializer)
    }
}

/// Filesystem identity of one in-flight request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItemId(String);

impl WorkItemId {
    pub fn generate() -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("code_{millis}_{}", &suffix[..8]))
    }
}

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_serializes_to_desktop_shape() {
        let ok = serde_json::to_value(CompileResult::Success {
            output: "Hello\n".into(),
        })
        .unwrap();
        assert_eq!(ok, serde_json::json!({ "success": true, "output": "Hello\n" }));

        let failed = serde_json::to_value(CompileResult::failure(
            ErrorKind::CompileError,
            "error: expected ';'",
        ))
        .unwrap();
        assert_eq!(
            failed,
            serde_json::json!({
                "success": false,
                "kind": "compile_error",
                "error": "error: expected ';'"
            })
        );
    }

    #[test]
    fn work_item_ids_differ_within_same_millisecond() {
        let a = WorkItemId::generate();
        let b = WorkItemId::generate();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("code_"));
    }
}
