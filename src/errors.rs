//! Typed error hierarchy for the flow orchestrator.
//!
//! Three top-level enums cover the three failure domains:
//! - `OrchestratorError`: facade and queue operations returned to callers
//! - `ContainerError`: sandbox creation, inspection and teardown
//! - `ExecutionError`: a single task's work, absorbed into the task row

use thiserror::Error;

/// Errors returned synchronously from facade and queue operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Model is required (provider '{provider}', model '{model}')")]
    InvalidModel { provider: String, model: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Flow {flow_id} has no active queue")]
    NoActiveQueue { flow_id: i64 },

    #[error("Flow {flow_id} not found")]
    FlowNotFound { flow_id: i64 },

    #[error("Store error: {0:#}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Container(#[from] ContainerError),
}

/// Errors from the container lifecycle manager and runtime.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Failed to create container for flow {flow_id}: {source:#}")]
    Creation {
        flow_id: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error("Container {container} not found")]
    NotFound { container: String },

    #[error("Container {container} bound to flow {flow_id} is no longer running")]
    Gone { flow_id: i64, container: String },

    #[error("Container runtime error: {0:#}")]
    Runtime(#[source] anyhow::Error),
}

/// Errors produced while executing one task.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The task failed; the flow carries on with the next task.
    #[error("Task failed: {0:#}")]
    Failed(#[source] anyhow::Error),

    /// The worker cannot continue; the flow moves to `error`.
    #[error("Flow cannot proceed: {0:#}")]
    Fatal(#[source] anyhow::Error),
}

impl ExecutionError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(anyhow::anyhow!(message.into()))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl From<ContainerError> for ExecutionError {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::NotFound { .. } | ContainerError::Gone { .. } => {
                Self::Fatal(anyhow::Error::new(err))
            }
            other => Self::Failed(anyhow::Error::new(other)),
        }
    }
}
