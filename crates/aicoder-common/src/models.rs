use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name given to every freshly created flow.
pub const DEFAULT_FLOW_NAME: &str = "New Task";

/// Returned when a stored status or kind string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid {field}: {value}")]
pub struct ParseError {
    pub field: &'static str,
    pub value: String,
}

impl ParseError {
    fn new(field: &'static str, value: &str) -> Self {
        Self {
            field,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    InProgress,
    Finished,
    Error,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }
}

impl FromStr for FlowStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "finished" => Ok(Self::Finished),
            "error" => Ok(Self::Error),
            _ => Err(ParseError::new("flow status", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Finished,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }

    /// Finished and errored tasks are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }
}

impl FromStr for TaskStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "error" => Ok(Self::Error),
            _ => Err(ParseError::new("task status", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// A prompt typed by the user.
    Input,
    /// A shell command run inside the flow's container.
    Command,
    Browser,
    Code,
    Ask,
    Done,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Command => "command",
            Self::Browser => "browser",
            Self::Code => "code",
            Self::Ask => "ask",
            Self::Done => "done",
        }
    }
}

impl FromStr for TaskKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(Self::Input),
            "command" | "terminal" => Ok(Self::Command),
            "browser" => Ok(Self::Browser),
            "code" => Ok(Self::Code),
            "ask" => Ok(Self::Ask),
            "done" => Ok(Self::Done),
            _ => Err(ParseError::new("task kind", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Input,
    Output,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

impl FromStr for LogKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(Self::Input),
            "output" => Ok(Self::Output),
            _ => Err(ParseError::new("log kind", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Running,
    Stopped,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl FromStr for ContainerStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            _ => Err(ParseError::new("container status", s)),
        }
    }
}

/// Provider + model identifier pair a flow is bound to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelRef {
    pub provider: String,
    pub id: String,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            id: id.into(),
        }
    }

    /// True when either half is blank.
    pub fn is_incomplete(&self) -> bool {
        self.provider.trim().is_empty() || self.id.trim().is_empty()
    }
}

/// The sandbox container bound to a flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerBinding {
    /// Store row id.
    pub id: i64,
    pub name: String,
    pub image: String,
    /// Identifier assigned by the container runtime.
    pub local_id: String,
    pub status: ContainerStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: i64,
    pub name: String,
    pub status: FlowStatus,
    pub model: ModelRef,
    pub container: Option<ContainerBinding>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFlow {
    pub name: String,
    pub model: ModelRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub flow_id: i64,
    pub kind: TaskKind,
    pub message: String,
    pub args: serde_json::Value,
    pub status: TaskStatus,
    pub results: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub flow_id: i64,
    pub kind: TaskKind,
    pub message: String,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub id: i64,
    pub flow_id: i64,
    pub kind: LogKind,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Browser {
    pub url: String,
    pub screenshot_url: String,
}

/// A flow together with everything a client needs to render it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDetail {
    pub flow: Flow,
    pub tasks: Vec<Task>,
    pub logs: Vec<LogLine>,
    pub terminal_connected: bool,
    pub browser: Browser,
}
