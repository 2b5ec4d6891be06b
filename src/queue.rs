//! Per-flow task queues and their worker loops.
//!
//! Each active flow owns one FIFO queue drained by exactly one worker task.
//! Admission never waits on execution: `add_task` pushes and wakes the
//! worker, which runs tasks one at a time through the [`Executor`].
//!
//! Queue states: no queue, active, draining (stop requested, admissions
//! rejected, current task allowed to finish), then removed by the worker
//! on exit.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use aicoder_common::{Event, FlowStatus, Task, TaskStatus};
use futures::FutureExt;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::container::ContainerManager;
use crate::errors::{ExecutionError, OrchestratorError};
use crate::executor::{Executor, TaskContext};
use crate::store::Store;

/// Registry of flow queues. Cheap to clone.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    queues: Mutex<HashMap<i64, Arc<FlowQueue>>>,
    workers: TaskTracker,
    store: Arc<dyn Store>,
    containers: ContainerManager,
    executor: Arc<dyn Executor>,
    bus: EventBus,
}

struct FlowQueue {
    flow_id: i64,
    pending: Mutex<VecDeque<Task>>,
    wake: Notify,
    stop: CancellationToken,
    /// Fires once the worker has exited and released the queue.
    stopped: CancellationToken,
    draining: AtomicBool,
    /// Set when the flow is finishing; the worker reclaims the container on exit.
    reclaim: AtomicBool,
}

impl FlowQueue {
    fn new(flow_id: i64) -> Self {
        Self {
            flow_id,
            pending: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            stop: CancellationToken::new(),
            stopped: CancellationToken::new(),
            draining: AtomicBool::new(false),
            reclaim: AtomicBool::new(false),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    fn push(&self, task: Task) {
        self.tasks().push_back(task);
        self.wake.notify_one();
    }

    fn pop(&self) -> Option<Task> {
        self.tasks().pop_front()
    }

    /// Stop admitting, discard what has not started, and tell the worker to
    /// exit after its current task.
    fn drain(&self) -> Vec<Task> {
        self.draining.store(true, Ordering::SeqCst);
        let discarded = self.tasks().drain(..).collect();
        self.stop.cancel();
        discarded
    }
}

impl QueueManager {
    pub fn new(
        store: Arc<dyn Store>,
        containers: ContainerManager,
        executor: Arc<dyn Executor>,
        bus: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                queues: Mutex::new(HashMap::new()),
                workers: TaskTracker::new(),
                store,
                containers,
                executor,
                bus,
            }),
        }
    }

    /// Start a queue and its worker for `flow_id`.
    ///
    /// Returns false without doing anything when the flow already has an
    /// active queue. A queue that is still draining is replaced; the new
    /// worker waits until the old one has exited before it runs anything.
    pub fn add_queue(&self, flow_id: i64) -> bool {
        let queue = Arc::new(FlowQueue::new(flow_id));
        let previous = {
            let mut queues = self.inner.queues();
            let previous = match queues.get(&flow_id) {
                Some(existing) if !existing.is_draining() => return false,
                Some(existing) => Some(existing.stopped.clone()),
                None => None,
            };
            queues.insert(flow_id, queue.clone());
            previous
        };

        info!(flow_id, "Queue started");
        let inner = self.inner.clone();
        self.inner.workers.spawn(async move {
            if let Some(previous) = previous {
                previous.cancelled().await;
            }
            inner.run_worker(queue).await;
        });
        true
    }

    /// Admit a task to its flow's queue.
    pub fn add_task(&self, task: Task) -> Result<(), OrchestratorError> {
        let queues = self.inner.queues();
        match queues.get(&task.flow_id) {
            Some(queue) if !queue.is_draining() => {
                debug!(flow_id = task.flow_id, task_id = task.id, "Task queued");
                queue.push(task);
                Ok(())
            }
            _ => Err(OrchestratorError::NoActiveQueue {
                flow_id: task.flow_id,
            }),
        }
    }

    /// Discard the flow's pending tasks and stop its worker after the current
    /// task. Discarded tasks are marked `error` and announced. Returns how
    /// many were discarded.
    pub async fn clean_queue(&self, flow_id: i64) -> usize {
        let Some(queue) = self.inner.queues().get(&flow_id).cloned() else {
            return 0;
        };
        queue.reclaim.store(true, Ordering::SeqCst);
        let discarded = queue.drain();
        let count = discarded.len();
        info!(flow_id, discarded = count, "Queue draining");
        for task in discarded {
            self.inner
                .settle_quietly(task, json!({ "error": "discarded: flow finished" }))
                .await;
        }
        count
    }

    /// Whether the flow has an active (not draining) queue.
    pub fn has_queue(&self, flow_id: i64) -> bool {
        self.inner
            .queues()
            .get(&flow_id)
            .is_some_and(|queue| !queue.is_draining())
    }

    /// Stop every worker after its current task and wait for all of them.
    ///
    /// Pending tasks are left `pending` in the store so a later process can
    /// pick them up again.
    pub async fn shutdown(&self) {
        let queues: Vec<Arc<FlowQueue>> = self.inner.queues().values().cloned().collect();
        for queue in &queues {
            queue.draining.store(true, Ordering::SeqCst);
            queue.stop.cancel();
        }
        self.inner.workers.close();
        self.inner.workers.wait().await;
        info!(flows = queues.len(), "All queue workers stopped");
    }
}

impl QueueInner {
    fn queues(&self) -> MutexGuard<'_, HashMap<i64, Arc<FlowQueue>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the registry entry if it still belongs to `queue`.
    fn release(&self, queue: &Arc<FlowQueue>) {
        let mut queues = self.queues();
        if queues
            .get(&queue.flow_id)
            .is_some_and(|current| Arc::ptr_eq(current, queue))
        {
            queues.remove(&queue.flow_id);
        }
    }

    async fn run_worker(&self, queue: Arc<FlowQueue>) {
        let flow_id = queue.flow_id;
        debug!(flow_id, "Worker running");

        loop {
            if queue.stop.is_cancelled() {
                break;
            }
            let Some(task) = queue.pop() else {
                tokio::select! {
                    _ = queue.wake.notified() => {}
                    _ = queue.stop.cancelled() => {}
                }
                continue;
            };

            if let Err(fatal) = self.run_task(task).await {
                self.fail_flow(&queue, fatal).await;
                break;
            }
        }

        if queue.reclaim.load(Ordering::SeqCst) {
            self.reclaim_container(flow_id).await;
        }
        self.release(&queue);
        queue.stopped.cancel();
        info!(flow_id, "Queue stopped");
    }

    /// Tear down a container the last task may have created after the flow
    /// was asked to finish.
    async fn reclaim_container(&self, flow_id: i64) {
        match self.store.read_flow(flow_id).await {
            Ok(Some(flow)) => {
                self.containers.teardown_flow(&flow);
            }
            Ok(None) => {}
            Err(e) => warn!(flow_id, error = %e, "Failed to read flow for container teardown"),
        }
    }

    /// Run one task to a terminal state. Only fatal errors come back.
    async fn run_task(&self, task: Task) -> Result<(), ExecutionError> {
        let flow_id = task.flow_id;
        let task_id = task.id;

        let container = match self.containers.ensure(flow_id).await {
            Ok(container) => container,
            Err(e) => {
                let fatal = ExecutionError::Fatal(anyhow::Error::new(e));
                self.settle_quietly(task, error_result(&fatal)).await;
                return Err(fatal);
            }
        };

        let task = self.transition(task_id, TaskStatus::Running, None).await?;
        info!(flow_id, task_id, kind = task.kind.as_str(), "Task running");

        let ctx = TaskContext::new(
            container,
            self.containers.clone(),
            self.store.clone(),
            self.bus.clone(),
        );
        let outcome = AssertUnwindSafe(self.executor.execute(&ctx, &task))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ExecutionError::failed("executor panicked")));

        match outcome {
            Ok(results) => {
                self.transition(task_id, TaskStatus::Finished, Some(results))
                    .await?;
                info!(flow_id, task_id, "Task finished");
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                self.transition(task_id, TaskStatus::Error, Some(error_result(&e)))
                    .await?;
                Err(e)
            }
            Err(e) => {
                warn!(flow_id, task_id, error = %e, "Task failed");
                self.transition(task_id, TaskStatus::Error, Some(error_result(&e)))
                    .await?;
                Ok(())
            }
        }
    }

    /// Persist a status change and announce it. A store failure stops the flow.
    async fn transition(
        &self,
        task_id: i64,
        status: TaskStatus,
        results: Option<Value>,
    ) -> Result<Task, ExecutionError> {
        let task = self
            .store
            .update_task(task_id, status, results)
            .await
            .map_err(ExecutionError::Fatal)?;
        self.bus.publish(Event::TaskUpdated { task: task.clone() });
        Ok(task)
    }

    /// Mark a task that will never run as `error`, logging store failures.
    async fn settle_quietly(&self, task: Task, results: Value) {
        match self
            .store
            .update_task(task.id, TaskStatus::Error, Some(results))
            .await
        {
            Ok(task) => {
                self.bus.publish(Event::TaskUpdated { task });
            }
            Err(e) => {
                error!(flow_id = task.flow_id, task_id = task.id, error = %e, "Failed to settle task");
            }
        }
    }

    /// The worker cannot continue: discard the queue, move the flow to
    /// `error` and reclaim its container.
    async fn fail_flow(&self, queue: &FlowQueue, fatal: ExecutionError) {
        let flow_id = queue.flow_id;
        let finishing = queue.stop.is_cancelled();
        error!(flow_id, error = %fatal, "Flow cannot proceed");

        for task in queue.drain() {
            self.settle_quietly(task, json!({ "error": "discarded: flow failed" }))
                .await;
        }

        // A finish already in progress owns the flow's final status.
        if finishing {
            return;
        }
        // Only an in-progress flow can fail; a finish that committed while
        // the queue was settling keeps `finished`.
        match self
            .store
            .transition_flow_status(flow_id, FlowStatus::InProgress, FlowStatus::Error)
            .await
        {
            Ok(Some(flow)) => {
                self.containers.teardown_flow(&flow);
                self.bus.publish(Event::FlowUpdated { flow });
            }
            Ok(None) => {
                debug!(flow_id, "Flow already left in_progress, keeping its status");
            }
            Err(e) => {
                error!(flow_id, error = %e, "Failed to record flow error");
            }
        }
    }
}

fn error_result(err: &ExecutionError) -> Value {
    json!({ "error": err.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::container::testing::FakeRuntime;
    use crate::store::SqliteStore;
    use aicoder_common::{ModelRef, NewFlow, NewTask, TaskKind};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Records execution order; `sleep:<ms>` messages take that long.
    #[derive(Default)]
    struct RecordingExecutor {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Executor for RecordingExecutor {
        async fn execute(&self, _ctx: &TaskContext, task: &Task) -> Result<Value, ExecutionError> {
            if let Some(ms) = task.message.strip_prefix("sleep:") {
                tokio::time::sleep(Duration::from_millis(ms.parse().unwrap())).await;
            }
            self.seen.lock().unwrap().push(task.message.clone());
            match task.message.as_str() {
                "fail" => Err(ExecutionError::failed("boom")),
                "fatal" => Err(ExecutionError::Fatal(anyhow::anyhow!("sandbox lost"))),
                "panic" => panic!("executor bug"),
                _ => Ok(json!({ "echo": task.message })),
            }
        }
    }

    struct Harness {
        queues: QueueManager,
        store: Arc<SqliteStore>,
        executor: Arc<RecordingExecutor>,
        flow_id: i64,
    }

    async fn harness() -> Harness {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let flow = store
            .create_flow(NewFlow {
                name: "New Task".to_string(),
                model: ModelRef::new("ollama", "llama3"),
            })
            .await
            .unwrap();
        let containers = ContainerManager::new(
            Arc::new(FakeRuntime::default()),
            store.clone(),
            SandboxConfig::default(),
        );
        let executor = Arc::new(RecordingExecutor::default());
        let queues = QueueManager::new(store.clone(), containers, executor.clone(), EventBus::new(16));
        Harness {
            queues,
            store,
            executor,
            flow_id: flow.id,
        }
    }

    async fn enqueue(h: &Harness, message: &str) -> Task {
        let task = h
            .store
            .create_task(NewTask {
                flow_id: h.flow_id,
                kind: TaskKind::Input,
                message: message.to_string(),
                args: json!({}),
            })
            .await
            .unwrap();
        h.queues.add_task(task.clone()).unwrap();
        task
    }

    async fn wait_terminal(h: &Harness, count: usize) -> Vec<Task> {
        for _ in 0..200 {
            let tasks = h.store.read_tasks_by_flow(h.flow_id).await.unwrap();
            if tasks.iter().filter(|t| t.status.is_terminal()).count() >= count {
                return tasks;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tasks did not settle");
    }

    #[tokio::test]
    async fn test_add_queue_is_idempotent() {
        let h = harness().await;
        assert!(h.queues.add_queue(h.flow_id));
        assert!(!h.queues.add_queue(h.flow_id));
        assert!(h.queues.has_queue(h.flow_id));
    }

    #[tokio::test]
    async fn test_add_task_without_queue_fails() {
        let h = harness().await;
        let task = h
            .store
            .create_task(NewTask {
                flow_id: h.flow_id,
                kind: TaskKind::Input,
                message: "hi".to_string(),
                args: json!({}),
            })
            .await
            .unwrap();
        let err = h.queues.add_task(task).unwrap_err();
        assert!(matches!(err, OrchestratorError::NoActiveQueue { flow_id } if flow_id == h.flow_id));
    }

    #[tokio::test]
    async fn test_tasks_run_in_fifo_order() {
        let h = harness().await;
        h.queues.add_queue(h.flow_id);
        enqueue(&h, "sleep:30").await;
        enqueue(&h, "sleep:5").await;
        enqueue(&h, "third").await;

        wait_terminal(&h, 3).await;
        assert_eq!(
            *h.executor.seen.lock().unwrap(),
            vec!["sleep:30", "sleep:5", "third"]
        );
    }

    #[tokio::test]
    async fn test_failed_task_does_not_stop_flow() {
        let h = harness().await;
        h.queues.add_queue(h.flow_id);
        enqueue(&h, "fail").await;
        enqueue(&h, "panic").await;
        enqueue(&h, "ok").await;

        let tasks = wait_terminal(&h, 3).await;
        assert_eq!(tasks[0].status, TaskStatus::Error);
        assert_eq!(tasks[1].status, TaskStatus::Error);
        assert_eq!(tasks[2].status, TaskStatus::Finished);
        assert_eq!(tasks[2].results, Some(json!({ "echo": "ok" })));
        assert!(h.queues.has_queue(h.flow_id));
    }

    #[tokio::test]
    async fn test_fatal_error_moves_flow_to_error() {
        let h = harness().await;
        h.queues.add_queue(h.flow_id);
        enqueue(&h, "fatal").await;

        wait_terminal(&h, 1).await;
        for _ in 0..100 {
            if !h.queues.has_queue(h.flow_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!h.queues.has_queue(h.flow_id));
        let flow = h.store.read_flow(h.flow_id).await.unwrap().unwrap();
        assert_eq!(flow.status, FlowStatus::Error);
    }

    #[tokio::test]
    async fn test_clean_queue_discards_pending() {
        let h = harness().await;
        h.queues.add_queue(h.flow_id);
        enqueue(&h, "sleep:100").await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        for name in ["a", "b", "c"] {
            enqueue(&h, name).await;
        }

        assert_eq!(h.queues.clean_queue(h.flow_id).await, 3);
        assert!(!h.queues.has_queue(h.flow_id));
        h.queues.shutdown().await;

        assert_eq!(*h.executor.seen.lock().unwrap(), vec!["sleep:100"]);
        let tasks = h.store.read_tasks_by_flow(h.flow_id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Finished);
        assert!(tasks[1..].iter().all(|t| t.status == TaskStatus::Error));
    }

    #[tokio::test]
    async fn test_requeue_after_drain() {
        let h = harness().await;
        h.queues.add_queue(h.flow_id);
        h.queues.clean_queue(h.flow_id).await;
        assert!(h.queues.add_queue(h.flow_id));
        enqueue(&h, "again").await;
        wait_terminal(&h, 1).await;
        assert_eq!(*h.executor.seen.lock().unwrap(), vec!["again"]);
    }
}
