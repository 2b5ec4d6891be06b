use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use aicoder_common::{
    ContainerBinding, ContainerStatus, Flow, FlowStatus, LogKind, LogLine, ModelRef, NewFlow,
    NewTask, Task, TaskKind, TaskStatus,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::Store;

const FLOW_COLUMNS: &str = "f.id, f.name, f.status, f.model_provider, f.model, f.created_at,
     c.id, c.name, c.image, c.local_id, c.status";

const TASK_COLUMNS: &str = "id, flow_id, type, message, args, status, results, created_at";

/// Async-safe SQLite store.
///
/// Wraps the connection behind `Arc<Mutex>` and runs every query on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<std::sync::Mutex<StoreDb>>,
}

impl SqliteStore {
    /// Open (or create) a database file and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// In-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = StoreDb { conn };
        db.init()?;
        Ok(Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        })
    }

    /// Run a closure with access to the database on a blocking thread.
    async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&StoreDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_flow(&self, flow: NewFlow) -> Result<Flow> {
        self.call(move |db| db.create_flow(&flow)).await
    }

    async fn read_flow(&self, id: i64) -> Result<Option<Flow>> {
        self.call(move |db| db.read_flow(id)).await
    }

    async fn read_all_flows(&self) -> Result<Vec<Flow>> {
        self.call(|db| db.read_all_flows()).await
    }

    async fn update_flow_status(&self, id: i64, status: FlowStatus) -> Result<Flow> {
        self.call(move |db| db.update_flow_status(id, status)).await
    }

    async fn transition_flow_status(
        &self,
        id: i64,
        from: FlowStatus,
        status: FlowStatus,
    ) -> Result<Option<Flow>> {
        self.call(move |db| db.transition_flow_status(id, from, status))
            .await
    }

    async fn bind_container(
        &self,
        flow_id: i64,
        name: &str,
        image: &str,
        local_id: &str,
    ) -> Result<ContainerBinding> {
        let (name, image, local_id) = (name.to_string(), image.to_string(), local_id.to_string());
        self.call(move |db| db.bind_container(flow_id, &name, &image, &local_id))
            .await
    }

    async fn update_container_status(
        &self,
        container_id: i64,
        status: ContainerStatus,
    ) -> Result<()> {
        self.call(move |db| db.update_container_status(container_id, status))
            .await
    }

    async fn create_task(&self, task: NewTask) -> Result<Task> {
        self.call(move |db| db.create_task(&task)).await
    }

    async fn update_task(
        &self,
        id: i64,
        status: TaskStatus,
        results: Option<serde_json::Value>,
    ) -> Result<Task> {
        self.call(move |db| db.update_task(id, status, results.as_ref()))
            .await
    }

    async fn read_tasks_by_flow(&self, flow_id: i64) -> Result<Vec<Task>> {
        self.call(move |db| db.read_tasks_by_flow(flow_id)).await
    }

    async fn append_log(&self, flow_id: i64, kind: LogKind, text: &str) -> Result<LogLine> {
        let text = text.to_string();
        self.call(move |db| db.append_log(flow_id, kind, &text)).await
    }

    async fn get_logs_by_flow(&self, flow_id: i64) -> Result<Vec<LogLine>> {
        self.call(move |db| db.get_logs_by_flow(flow_id)).await
    }
}

struct StoreDb {
    conn: Connection,
}

impl StoreDb {
    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS containers (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    image TEXT NOT NULL,
                    local_id TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running'
                );

                CREATE TABLE IF NOT EXISTS flows (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'in_progress',
                    model_provider TEXT NOT NULL,
                    model TEXT NOT NULL,
                    container_id INTEGER REFERENCES containers(id),
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    flow_id INTEGER NOT NULL REFERENCES flows(id) ON DELETE CASCADE,
                    type TEXT NOT NULL,
                    message TEXT NOT NULL DEFAULT '',
                    args TEXT NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL DEFAULT 'pending',
                    results TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    flow_id INTEGER NOT NULL REFERENCES flows(id) ON DELETE CASCADE,
                    type TEXT NOT NULL,
                    message TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_flow ON tasks(flow_id);
                CREATE INDEX IF NOT EXISTS idx_logs_flow ON logs(flow_id);
                CREATE INDEX IF NOT EXISTS idx_flows_status ON flows(status);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Flows ─────────────────────────────────────────────────────────

    fn create_flow(&self, flow: &NewFlow) -> Result<Flow> {
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO flows (name, status, model_provider, model, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    flow.name,
                    FlowStatus::InProgress.as_str(),
                    flow.model.provider,
                    flow.model.id,
                    now
                ],
            )
            .context("Failed to insert flow")?;
        let id = self.conn.last_insert_rowid();
        self.read_flow(id)?.context("Flow not found after insert")
    }

    fn read_flow(&self, id: i64) -> Result<Option<Flow>> {
        let sql = format!(
            "SELECT {FLOW_COLUMNS} FROM flows f LEFT JOIN containers c ON c.id = f.container_id
             WHERE f.id = ?1"
        );
        let row = self
            .conn
            .query_row(&sql, params![id], FlowRow::from_row)
            .optional()
            .context("Failed to query flow")?;
        row.map(FlowRow::into_flow).transpose()
    }

    fn read_all_flows(&self) -> Result<Vec<Flow>> {
        let sql = format!(
            "SELECT {FLOW_COLUMNS} FROM flows f LEFT JOIN containers c ON c.id = f.container_id
             ORDER BY f.id"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare read_all_flows")?;
        let rows = stmt
            .query_map([], FlowRow::from_row)
            .context("Failed to query flows")?;
        let mut flows = Vec::new();
        for row in rows {
            flows.push(row.context("Failed to read flow row")?.into_flow()?);
        }
        Ok(flows)
    }

    fn update_flow_status(&self, id: i64, status: FlowStatus) -> Result<Flow> {
        let changed = self
            .conn
            .execute(
                "UPDATE flows SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now(), id],
            )
            .context("Failed to update flow status")?;
        if changed == 0 {
            anyhow::bail!("Flow {} not found", id);
        }
        self.read_flow(id)?
            .context("Flow not found after status update")
    }

    fn transition_flow_status(
        &self,
        id: i64,
        from: FlowStatus,
        status: FlowStatus,
    ) -> Result<Option<Flow>> {
        let changed = self
            .conn
            .execute(
                "UPDATE flows SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![status.as_str(), Utc::now(), id, from.as_str()],
            )
            .context("Failed to transition flow status")?;
        if changed == 0 {
            return Ok(None);
        }
        self.read_flow(id)
    }

    // ── Containers ────────────────────────────────────────────────────

    fn bind_container(
        &self,
        flow_id: i64,
        name: &str,
        image: &str,
        local_id: &str,
    ) -> Result<ContainerBinding> {
        self.conn
            .execute(
                "INSERT INTO containers (name, image, local_id, status) VALUES (?1, ?2, ?3, ?4)",
                params![name, image, local_id, ContainerStatus::Running.as_str()],
            )
            .context("Failed to insert container")?;
        let container_id = self.conn.last_insert_rowid();
        let changed = self
            .conn
            .execute(
                "UPDATE flows SET container_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![container_id, Utc::now(), flow_id],
            )
            .context("Failed to bind container to flow")?;
        if changed == 0 {
            anyhow::bail!("Flow {} not found", flow_id);
        }
        Ok(ContainerBinding {
            id: container_id,
            name: name.to_string(),
            image: image.to_string(),
            local_id: local_id.to_string(),
            status: ContainerStatus::Running,
        })
    }

    fn update_container_status(&self, container_id: i64, status: ContainerStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE containers SET status = ?1 WHERE id = ?2",
                params![status.as_str(), container_id],
            )
            .context("Failed to update container status")?;
        Ok(())
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    fn create_task(&self, task: &NewTask) -> Result<Task> {
        let now = Utc::now();
        let args = serde_json::to_string(&task.args).context("Failed to encode task args")?;
        self.conn
            .execute(
                "INSERT INTO tasks (flow_id, type, message, args, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    task.flow_id,
                    task.kind.as_str(),
                    task.message,
                    args,
                    TaskStatus::Pending.as_str(),
                    now
                ],
            )
            .context("Failed to insert task")?;
        let id = self.conn.last_insert_rowid();
        self.read_task(id)?.context("Task not found after insert")
    }

    fn read_task(&self, id: i64) -> Result<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], TaskRow::from_row)
            .optional()
            .context("Failed to query task")?;
        row.map(TaskRow::into_task).transpose()
    }

    fn update_task(
        &self,
        id: i64,
        status: TaskStatus,
        results: Option<&serde_json::Value>,
    ) -> Result<Task> {
        let results = results
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode task results")?;
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET status = ?1, results = COALESCE(?2, results), updated_at = ?3
                 WHERE id = ?4",
                params![status.as_str(), results, Utc::now(), id],
            )
            .context("Failed to update task")?;
        if changed == 0 {
            anyhow::bail!("Task {} not found", id);
        }
        self.read_task(id)?.context("Task not found after update")
    }

    fn read_tasks_by_flow(&self, flow_id: i64) -> Result<Vec<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE flow_id = ?1 ORDER BY id");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare read_tasks_by_flow")?;
        let rows = stmt
            .query_map(params![flow_id], TaskRow::from_row)
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    // ── Logs ──────────────────────────────────────────────────────────

    fn append_log(&self, flow_id: i64, kind: LogKind, text: &str) -> Result<LogLine> {
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO logs (flow_id, type, message, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![flow_id, kind.as_str(), text, now],
            )
            .context("Failed to insert log")?;
        Ok(LogLine {
            id: self.conn.last_insert_rowid(),
            flow_id,
            kind,
            text: text.to_string(),
            created_at: now,
        })
    }

    fn get_logs_by_flow(&self, flow_id: i64) -> Result<Vec<LogLine>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, flow_id, type, message, created_at FROM logs
                 WHERE flow_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare get_logs_by_flow")?;
        let rows = stmt
            .query_map(params![flow_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, DateTime<Utc>>(4)?,
                ))
            })
            .context("Failed to query logs")?;
        let mut logs = Vec::new();
        for row in rows {
            let (id, flow_id, kind, text, created_at) = row.context("Failed to read log row")?;
            logs.push(LogLine {
                id,
                flow_id,
                kind: LogKind::from_str(&kind)?,
                text,
                created_at,
            });
        }
        Ok(logs)
    }
}

/// Raw flow row joined with its optional container.
struct FlowRow {
    id: i64,
    name: String,
    status: String,
    model_provider: String,
    model: String,
    created_at: DateTime<Utc>,
    container_id: Option<i64>,
    container_name: Option<String>,
    container_image: Option<String>,
    container_local_id: Option<String>,
    container_status: Option<String>,
}

impl FlowRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            status: row.get(2)?,
            model_provider: row.get(3)?,
            model: row.get(4)?,
            created_at: row.get(5)?,
            container_id: row.get(6)?,
            container_name: row.get(7)?,
            container_image: row.get(8)?,
            container_local_id: row.get(9)?,
            container_status: row.get(10)?,
        })
    }

    fn into_flow(self) -> Result<Flow> {
        let container = match (
            self.container_id,
            self.container_name,
            self.container_image,
            self.container_local_id,
            self.container_status,
        ) {
            (Some(id), Some(name), Some(image), Some(local_id), Some(status)) => {
                Some(ContainerBinding {
                    id,
                    name,
                    image,
                    local_id,
                    status: ContainerStatus::from_str(&status)?,
                })
            }
            _ => None,
        };
        Ok(Flow {
            id: self.id,
            name: self.name,
            status: FlowStatus::from_str(&self.status)?,
            model: ModelRef::new(self.model_provider, self.model),
            container,
            created_at: self.created_at,
        })
    }
}

struct TaskRow {
    id: i64,
    flow_id: i64,
    kind: String,
    message: String,
    args: String,
    status: String,
    results: Option<String>,
    created_at: DateTime<Utc>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            flow_id: row.get(1)?,
            kind: row.get(2)?,
            message: row.get(3)?,
            args: row.get(4)?,
            status: row.get(5)?,
            results: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let args = serde_json::from_str(&self.args)
            .with_context(|| format!("Invalid args JSON on task {}", self.id))?;
        let results = self
            .results
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .with_context(|| format!("Invalid results JSON on task {}", self.id))?;
        Ok(Task {
            id: self.id,
            flow_id: self.flow_id,
            kind: TaskKind::from_str(&self.kind)?,
            message: self.message,
            args,
            status: TaskStatus::from_str(&self.status)?,
            results,
            created_at: self.created_at,
        })
    }
}
