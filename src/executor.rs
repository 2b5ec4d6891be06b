//! Task execution contract and the bundled sandbox executor.

use std::sync::Arc;

use aicoder_common::{Browser, Event, LogKind, LogLine, Task, TaskKind};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::bus::EventBus;
use crate::container::{ContainerHandle, ContainerManager, ExecOutput};
use crate::errors::ExecutionError;
use crate::store::Store;
use crate::terminal;

/// Performs the kind-specific work of one task.
///
/// Real implementation: `SandboxExecutor`. Returning
/// [`ExecutionError::Failed`] marks only this task as `error`;
/// [`ExecutionError::Fatal`] stops the flow.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, ctx: &TaskContext, task: &Task) -> Result<Value, ExecutionError>;
}

/// What an executor can reach while running a task.
pub struct TaskContext {
    flow_id: i64,
    container: ContainerHandle,
    containers: ContainerManager,
    store: Arc<dyn Store>,
    bus: EventBus,
}

impl TaskContext {
    pub fn new(
        container: ContainerHandle,
        containers: ContainerManager,
        store: Arc<dyn Store>,
        bus: EventBus,
    ) -> Self {
        Self {
            flow_id: container.flow_id,
            container,
            containers,
            store,
            bus,
        }
    }

    pub fn flow_id(&self) -> i64 {
        self.flow_id
    }

    pub fn container(&self) -> &ContainerHandle {
        &self.container
    }

    /// Run a command in the flow's container. A vanished container is fatal.
    pub async fn exec(&self, cmd: &[String]) -> Result<ExecOutput, ExecutionError> {
        debug!(flow_id = self.flow_id, container = %self.container.name, ?cmd, "Exec");
        Ok(self
            .containers
            .runtime()
            .exec(&self.container.local_id, cmd)
            .await?)
    }

    pub async fn log_input(&self, text: &str) -> Result<LogLine, ExecutionError> {
        self.append_log(LogKind::Input, text).await
    }

    pub async fn log_output(&self, text: &str) -> Result<LogLine, ExecutionError> {
        self.append_log(LogKind::Output, text).await
    }

    /// Persist a terminal line and publish it rendered for terminal clients.
    async fn append_log(&self, kind: LogKind, text: &str) -> Result<LogLine, ExecutionError> {
        let log = self
            .store
            .append_log(self.flow_id, kind, text)
            .await
            .map_err(ExecutionError::Failed)?;
        let rendered = LogLine {
            text: terminal::render(&log),
            ..log.clone()
        };
        self.bus.publish(Event::TerminalLogAdded { log: rendered });
        Ok(log)
    }

    pub fn update_browser(&self, browser: Browser) {
        self.bus.publish(Event::BrowserUpdated {
            flow_id: self.flow_id,
            browser,
        });
    }
}

/// Runs input and command tasks against the flow's sandbox container.
#[derive(Debug, Default, Clone)]
pub struct SandboxExecutor;

impl SandboxExecutor {
    pub fn new() -> Self {
        Self
    }

    async fn run_input(&self, ctx: &TaskContext, task: &Task) -> Result<Value, ExecutionError> {
        let query = arg_str(&task.args, "query").unwrap_or(task.message.as_str());
        info!(flow_id = ctx.flow_id(), task_id = task.id, "Received input");
        ctx.log_input(query).await?;
        Ok(json!({ "query": query }))
    }

    async fn run_command(&self, ctx: &TaskContext, task: &Task) -> Result<Value, ExecutionError> {
        let command = arg_str(&task.args, "command")
            .or_else(|| arg_str(&task.args, "input"))
            .unwrap_or(task.message.as_str())
            .trim();
        if command.is_empty() {
            return Err(ExecutionError::failed("empty command"));
        }

        ctx.log_input(command).await?;
        let cmd = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        let result = ctx.exec(&cmd).await?;
        if !result.output.is_empty() {
            ctx.log_output(&result.output).await?;
        }

        info!(
            flow_id = ctx.flow_id(),
            task_id = task.id,
            exit_code = result.exit_code,
            "Command finished"
        );
        if !result.success() {
            return Err(ExecutionError::failed(format!(
                "command exited with status {}: {}",
                result.exit_code,
                result.output.trim()
            )));
        }
        Ok(json!({ "exit_code": result.exit_code, "output": result.output }))
    }
}

#[async_trait]
impl Executor for SandboxExecutor {
    async fn execute(&self, ctx: &TaskContext, task: &Task) -> Result<Value, ExecutionError> {
        match task.kind {
            TaskKind::Input => self.run_input(ctx, task).await,
            TaskKind::Command => self.run_command(ctx, task).await,
            TaskKind::Done => Ok(json!({})),
            other => Err(ExecutionError::failed(format!(
                "no handler for task kind '{}'",
                other.as_str()
            ))),
        }
    }
}

fn arg_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}
