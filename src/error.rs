/// Typed engine errors
///
/// Node logic and external collaborators speak `anyhow` (like the rest of the crate),
/// but the execution boundary needs to tell a sandbox timeout from an SSRF rejection.
/// Every failure the engine itself raises is an `EngineError`; anything else coming
/// out of a node is wrapped as `EngineError::Node`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One schema violation found during registration or parameter checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Dotted/indexed path of the offending field (e.g. "properties[0].name")
    pub property: String,
    /// Human-readable description of the violation
    pub message: String,
}

impl ValidationIssue {
    pub fn new(property: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.property, self.message)
    }
}

/// Coarse classification used by callers deciding what to do with a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    SandboxTimeout,
    SandboxMemory,
    SandboxExecution,
    ResourceLimit,
    SecurityPolicy,
    Credential,
    Expression,
    Node,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation failed: {}", join_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Node type not found: {0}")]
    NodeNotFound(String),

    #[error("Sandbox execution timed out after {0} ms")]
    SandboxTimeout(u64),

    #[error("Sandbox memory limit of {0} bytes exceeded")]
    SandboxMemory(usize),

    #[error("Sandbox execution failed: {0}")]
    SandboxExecution(String),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("Blocked by security policy: {0}")]
    SecurityPolicy(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error(transparent)]
    Node(#[from] anyhow::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::InvalidData(_) => ErrorKind::Validation,
            EngineError::NodeNotFound(_) => ErrorKind::NotFound,
            EngineError::SandboxTimeout(_) => ErrorKind::SandboxTimeout,
            EngineError::SandboxMemory(_) => ErrorKind::SandboxMemory,
            EngineError::SandboxExecution(_) => ErrorKind::SandboxExecution,
            EngineError::ResourceLimit(_) => ErrorKind::ResourceLimit,
            EngineError::SecurityPolicy(_) => ErrorKind::SecurityPolicy,
            EngineError::Credential(_) => ErrorKind::Credential,
            EngineError::Expression(_) => ErrorKind::Expression,
            EngineError::Node(_) => ErrorKind::Node,
        }
    }

    /// Recover a typed error from an `anyhow` chain produced by node logic
    ///
    /// Helpers return `EngineError` wrapped in `anyhow::Error` when they are called
    /// from inside a node, so the original kind survives the trip through `?`.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<EngineError>() {
            Ok(engine_err) => engine_err,
            Err(other) => EngineError::Node(other),
        }
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| issue.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_survives_anyhow_round_trip() {
        let wrapped: anyhow::Error = EngineError::SecurityPolicy("localhost".into()).into();
        let recovered = EngineError::from_anyhow(wrapped);
        assert_eq!(recovered.kind(), ErrorKind::SecurityPolicy);
    }

    #[test]
    fn test_foreign_errors_become_node_errors() {
        let recovered = EngineError::from_anyhow(anyhow::anyhow!("boom"));
        assert_eq!(recovered.kind(), ErrorKind::Node);
        assert_eq!(recovered.to_string(), "boom");
    }

    #[test]
    fn test_validation_message_lists_every_issue() {
        let err = EngineError::Validation(vec![
            ValidationIssue::new("identifier", "is required"),
            ValidationIssue::new("properties[0].name", "is required"),
        ]);
        let message = err.to_string();
        assert!(message.contains("identifier: is required"));
        assert!(message.contains("properties[0].name: is required"));
    }
}
