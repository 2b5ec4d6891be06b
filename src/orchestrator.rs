//! The orchestration facade: the only entry point callers need.
//!
//! Wires the store, event bus, container manager and queue manager together
//! and exposes flow-level operations on top of them.

use std::sync::Arc;

use aicoder_common::{
    Browser, DEFAULT_FLOW_NAME, Event, EventKind, Flow, FlowDetail, FlowStatus, LogLine, ModelRef,
    NewFlow, NewTask, Task, TaskKind, TaskStatus, Topic,
};
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{EventBus, Subscription};
use crate::config::Config;
use crate::container::{ContainerManager, ContainerRuntime};
use crate::errors::OrchestratorError;
use crate::executor::Executor;
use crate::queue::QueueManager;
use crate::store::Store;
use crate::terminal;

pub struct Orchestrator {
    config: Config,
    store: Arc<dyn Store>,
    bus: EventBus,
    containers: ContainerManager,
    queues: QueueManager,
    finish_locks: DashMap<i64, Arc<tokio::sync::Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        runtime: Arc<dyn ContainerRuntime>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let bus = EventBus::new(config.events.buffer);
        let containers = ContainerManager::new(runtime, store.clone(), config.sandbox.clone());
        let queues = QueueManager::new(store.clone(), containers.clone(), executor, bus.clone());
        Self {
            config,
            store,
            bus,
            containers,
            queues,
            finish_locks: DashMap::new(),
        }
    }

    // ── Flows ─────────────────────────────────────────────────────────

    /// Persist a new flow and start its queue.
    pub async fn create_flow(&self, model: ModelRef) -> Result<Flow, OrchestratorError> {
        if model.is_incomplete() {
            return Err(OrchestratorError::InvalidModel {
                provider: model.provider,
                model: model.id,
            });
        }

        let flow = self
            .store
            .create_flow(NewFlow {
                name: DEFAULT_FLOW_NAME.to_string(),
                model,
            })
            .await
            .map_err(OrchestratorError::Store)?;

        self.queues.add_queue(flow.id);
        info!(flow_id = flow.id, provider = %flow.model.provider, model = %flow.model.id, "Flow created");
        self.bus.publish(Event::FlowUpdated { flow: flow.clone() });
        Ok(flow)
    }

    /// Stop the flow: discard pending tasks, tear the container down in the
    /// background, and mark the flow `finished`.
    ///
    /// Finishing an already finished flow returns it unchanged. A call that
    /// overlaps another finish of the same flow waits for it and returns the
    /// finished flow.
    pub async fn finish_flow(&self, flow_id: i64) -> Result<Flow, OrchestratorError> {
        let lock = self.finish_locks.entry(flow_id).or_default().clone();
        let _guard = lock.lock().await;
        let result = self.finish_once(flow_id).await;
        // Waiters hold their own clone of the lock and keep the entry alive.
        self.finish_locks
            .remove_if(&flow_id, |_, held| Arc::strong_count(held) == 2);
        result
    }

    async fn finish_once(&self, flow_id: i64) -> Result<Flow, OrchestratorError> {
        let flow = self.read_flow(flow_id).await?;
        if flow.status == FlowStatus::Finished {
            return Ok(flow);
        }

        let discarded = self.queues.clean_queue(flow_id).await;
        let flow = self
            .store
            .update_flow_status(flow_id, FlowStatus::Finished)
            .await
            .map_err(OrchestratorError::Store)?;
        self.containers.teardown_flow(&flow);

        info!(flow_id, discarded, "Flow finished");
        self.bus.publish(Event::FlowUpdated { flow: flow.clone() });
        Ok(flow)
    }

    pub async fn flows(&self) -> Result<Vec<Flow>, OrchestratorError> {
        self.store
            .read_all_flows()
            .await
            .map_err(OrchestratorError::Store)
    }

    /// A flow with its tasks, rendered terminal log and sandbox state.
    pub async fn flow(&self, flow_id: i64) -> Result<FlowDetail, OrchestratorError> {
        let flow = self.read_flow(flow_id).await?;
        let tasks = self
            .store
            .read_tasks_by_flow(flow_id)
            .await
            .map_err(OrchestratorError::Store)?;
        let logs = self
            .store
            .get_logs_by_flow(flow_id)
            .await
            .map_err(OrchestratorError::Store)?
            .into_iter()
            .map(|log| LogLine {
                text: terminal::render(&log),
                ..log
            })
            .collect();
        let terminal_connected = match &flow.container {
            Some(binding) => self.containers.is_running(binding).await,
            None => false,
        };

        Ok(FlowDetail {
            flow,
            tasks,
            logs,
            terminal_connected,
            browser: Browser::default(),
        })
    }

    pub fn available_models(&self) -> Vec<ModelRef> {
        self.config.available_models()
    }

    pub fn has_queue(&self, flow_id: i64) -> bool {
        self.queues.has_queue(flow_id)
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    /// Admit a user query as an `input` task.
    pub async fn create_task(&self, flow_id: i64, query: &str) -> Result<Task, OrchestratorError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(OrchestratorError::Validation(
                "query must not be empty".to_string(),
            ));
        }
        self.enqueue_task(flow_id, TaskKind::Input, query, json!({ "query": query }))
            .await
    }

    /// Persist a task of any kind and admit it to the flow's queue.
    pub async fn enqueue_task(
        &self,
        flow_id: i64,
        kind: TaskKind,
        message: &str,
        args: Value,
    ) -> Result<Task, OrchestratorError> {
        if !self.queues.has_queue(flow_id) {
            return Err(OrchestratorError::NoActiveQueue { flow_id });
        }

        let task = self
            .store
            .create_task(NewTask {
                flow_id,
                kind,
                message: message.to_string(),
                args,
            })
            .await
            .map_err(OrchestratorError::Store)?;
        self.bus.publish(Event::TaskAdded { task: task.clone() });

        if let Err(e) = self.queues.add_task(task.clone()) {
            // The flow stopped between the check and admission.
            self.settle_unadmitted(&task).await;
            return Err(e);
        }
        Ok(task)
    }

    async fn settle_unadmitted(&self, task: &Task) {
        match self
            .store
            .update_task(
                task.id,
                TaskStatus::Error,
                Some(json!({ "error": "flow has no active queue" })),
            )
            .await
        {
            Ok(task) => {
                self.bus.publish(Event::TaskUpdated { task });
            }
            Err(e) => warn!(flow_id = task.flow_id, task_id = task.id, error = %e, "Failed to settle task"),
        }
    }

    // ── Events ────────────────────────────────────────────────────────

    /// Events of one kind for one flow, until `ctx` is cancelled.
    pub fn subscribe(&self, flow_id: i64, kind: EventKind, ctx: &CancellationToken) -> Subscription {
        self.bus.subscribe(Topic::flow(flow_id, kind), ctx)
    }

    /// Events of one kind for every flow.
    pub fn subscribe_all(&self, kind: EventKind, ctx: &CancellationToken) -> Subscription {
        self.bus.subscribe(Topic::any_flow(kind), ctx)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Restart queues for flows left `in_progress` by an earlier process.
    ///
    /// Pending tasks are admitted again in creation order; tasks that were
    /// running when the process stopped are marked `error`. Returns the
    /// number of flows resumed.
    pub async fn resume(&self) -> Result<usize, OrchestratorError> {
        let flows = self.flows().await?;
        let mut resumed = 0;

        for flow in flows
            .into_iter()
            .filter(|f| f.status == FlowStatus::InProgress)
        {
            if !self.queues.add_queue(flow.id) {
                continue;
            }
            let tasks = self
                .store
                .read_tasks_by_flow(flow.id)
                .await
                .map_err(OrchestratorError::Store)?;

            let mut requeued = 0;
            let mut admitting = true;
            for task in tasks {
                match task.status {
                    TaskStatus::Running => {
                        let task = self
                            .store
                            .update_task(
                                task.id,
                                TaskStatus::Error,
                                Some(json!({ "error": "interrupted" })),
                            )
                            .await
                            .map_err(OrchestratorError::Store)?;
                        self.bus.publish(Event::TaskUpdated { task });
                    }
                    TaskStatus::Pending if admitting => {
                        if let Err(e) = self.queues.add_task(task.clone()) {
                            // The queue already tore itself down after a fatal error.
                            warn!(flow_id = flow.id, task_id = task.id, error = %e, "Stopped requeueing flow");
                            admitting = false;
                            self.settle_unadmitted(&task).await;
                        } else {
                            requeued += 1;
                        }
                    }
                    TaskStatus::Pending => self.settle_unadmitted(&task).await,
                    TaskStatus::Finished | TaskStatus::Error => {}
                }
            }

            info!(flow_id = flow.id, requeued, "Flow resumed");
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Stop all workers after their current task, wait for container
    /// teardowns, then close every subscription.
    pub async fn shutdown(&self) {
        self.queues.shutdown().await;
        self.containers.shutdown().await;
        self.bus.shutdown();
        info!("Orchestrator stopped");
    }

    async fn read_flow(&self, flow_id: i64) -> Result<Flow, OrchestratorError> {
        self.store
            .read_flow(flow_id)
            .await
            .map_err(OrchestratorError::Store)?
            .ok_or(OrchestratorError::FlowNotFound { flow_id })
    }
}
