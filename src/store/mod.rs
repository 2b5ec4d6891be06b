//! Durable storage contract for flows, tasks, containers and terminal logs.
//!
//! The orchestrator only talks to [`Store`]; [`SqliteStore`] is the bundled
//! implementation.

mod sqlite;

pub use sqlite::SqliteStore;

use aicoder_common::{
    ContainerBinding, ContainerStatus, Flow, FlowStatus, LogKind, LogLine, NewFlow, NewTask, Task,
    TaskStatus,
};
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_flow(&self, flow: NewFlow) -> Result<Flow>;

    async fn read_flow(&self, id: i64) -> Result<Option<Flow>>;

    async fn read_all_flows(&self) -> Result<Vec<Flow>>;

    async fn update_flow_status(&self, id: i64, status: FlowStatus) -> Result<Flow>;

    /// Move a flow to `status` only while it is still in `from`. Returns
    /// `None` when the flow has already left `from`.
    async fn transition_flow_status(
        &self,
        id: i64,
        from: FlowStatus,
        status: FlowStatus,
    ) -> Result<Option<Flow>>;

    /// Record a freshly created container and bind it to the flow.
    async fn bind_container(
        &self,
        flow_id: i64,
        name: &str,
        image: &str,
        local_id: &str,
    ) -> Result<ContainerBinding>;

    async fn update_container_status(&self, container_id: i64, status: ContainerStatus)
    -> Result<()>;

    /// Insert a task in `pending` status.
    async fn create_task(&self, task: NewTask) -> Result<Task>;

    async fn update_task(
        &self,
        id: i64,
        status: TaskStatus,
        results: Option<serde_json::Value>,
    ) -> Result<Task>;

    /// Tasks of a flow in creation order.
    async fn read_tasks_by_flow(&self, flow_id: i64) -> Result<Vec<Task>>;

    async fn append_log(&self, flow_id: i64, kind: LogKind, text: &str) -> Result<LogLine>;

    /// Log lines of a flow in creation order.
    async fn get_logs_by_flow(&self, flow_id: i64) -> Result<Vec<LogLine>>;
}
