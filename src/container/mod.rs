//! Per-flow sandbox containers.
//!
//! [`ContainerRuntime`] is the contract with the container engine;
//! [`DockerRuntime`] is the bollard-backed implementation. The
//! [`ContainerManager`] binds at most one container to each flow and makes
//! sure every bound container is torn down exactly once.

mod docker;
#[cfg(test)]
pub(crate) mod testing;

pub use docker::DockerRuntime;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use aicoder_common::{ContainerBinding, ContainerStatus, Flow};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::errors::ContainerError;
use crate::store::Store;

/// What to create for a flow.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
}

/// Engine-side state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStatus {
    Running,
    Stopped,
    Absent,
}

/// Result of running a command inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Abstraction over the container engine for testability.
/// Real implementation: `DockerRuntime`.
///
/// `stop`, `remove` and `exec` return [`ContainerError::NotFound`] when the
/// engine no longer knows the container.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container, returning its engine-local id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError>;

    async fn stop(&self, local_id: &str) -> Result<(), ContainerError>;

    async fn remove(&self, local_id: &str) -> Result<(), ContainerError>;

    async fn status(&self, local_id: &str) -> Result<RuntimeStatus, ContainerError>;

    async fn exec(&self, local_id: &str, cmd: &[String]) -> Result<ExecOutput, ContainerError>;
}

/// A flow's running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub flow_id: i64,
    /// Store id of the container binding.
    pub binding_id: i64,
    pub name: String,
    pub local_id: String,
}

impl ContainerHandle {
    pub fn from_binding(flow_id: i64, binding: &ContainerBinding) -> Self {
        Self {
            flow_id,
            binding_id: binding.id,
            name: binding.name.clone(),
            local_id: binding.local_id.clone(),
        }
    }
}

/// Container lifecycle manager.
///
/// Cheap to clone; clones share the creation locks, the teardown set and the
/// teardown tracker.
#[derive(Clone)]
pub struct ContainerManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn Store>,
    config: SandboxConfig,
    creation_locks: DashMap<i64, Arc<tokio::sync::Mutex<()>>>,
    destroyed: Mutex<HashSet<String>>,
    teardowns: TaskTracker,
}

impl ContainerManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn Store>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                runtime,
                store,
                config,
                creation_locks: DashMap::new(),
                destroyed: Mutex::new(HashSet::new()),
                teardowns: TaskTracker::new(),
            }),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.inner.runtime
    }

    /// Container name used for a flow.
    pub fn container_name(&self, flow_id: i64) -> String {
        format!("{}-flow-{}", self.inner.config.name_prefix, flow_id)
    }

    /// Return the flow's running container, creating it on first use.
    ///
    /// Concurrent calls for the same flow are serialized, so at most one
    /// container is ever created per flow. A binding whose container has
    /// stopped, vanished or been torn down yields [`ContainerError::Gone`].
    pub async fn ensure(&self, flow_id: i64) -> Result<ContainerHandle, ContainerError> {
        let lock = self
            .inner
            .creation_locks
            .entry(flow_id)
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let result = self.ensure_locked(flow_id).await;
        if result.is_err() {
            // Keep the entry while another caller is waiting on it.
            self.inner
                .creation_locks
                .remove_if(&flow_id, |_, held| Arc::strong_count(held) == 2);
        }
        result
    }

    async fn ensure_locked(&self, flow_id: i64) -> Result<ContainerHandle, ContainerError> {
        let flow = self
            .inner
            .store
            .read_flow(flow_id)
            .await
            .map_err(ContainerError::Runtime)?
            .ok_or_else(|| ContainerError::Creation {
                flow_id,
                source: anyhow::anyhow!("flow {} does not exist", flow_id),
            })?;

        if let Some(binding) = &flow.container {
            return self.check_bound(flow_id, binding).await;
        }

        self.create_for(flow_id).await
    }

    async fn check_bound(
        &self,
        flow_id: i64,
        binding: &ContainerBinding,
    ) -> Result<ContainerHandle, ContainerError> {
        let gone = || ContainerError::Gone {
            flow_id,
            container: binding.name.clone(),
        };
        if binding.status != ContainerStatus::Running || self.is_destroyed(&binding.local_id) {
            return Err(gone());
        }
        match self.inner.runtime.status(&binding.local_id).await? {
            RuntimeStatus::Running => Ok(ContainerHandle::from_binding(flow_id, binding)),
            RuntimeStatus::Stopped | RuntimeStatus::Absent => Err(gone()),
        }
    }

    async fn create_for(&self, flow_id: i64) -> Result<ContainerHandle, ContainerError> {
        let spec = ContainerSpec {
            name: self.container_name(flow_id),
            image: self.inner.config.image.clone(),
            env: self.inner.config.env.clone(),
        };

        info!(flow_id, container = %spec.name, image = %spec.image, "Creating container");
        let local_id = self
            .inner
            .runtime
            .create(&spec)
            .await
            .map_err(|e| ContainerError::Creation {
                flow_id,
                source: anyhow::Error::new(e),
            })?;

        let binding = match self
            .inner
            .store
            .bind_container(flow_id, &spec.name, &spec.image, &local_id)
            .await
        {
            Ok(binding) => binding,
            Err(e) => {
                // Unrecorded containers would never be reclaimed.
                self.remove_unbound(&local_id).await;
                return Err(ContainerError::Creation { flow_id, source: e });
            }
        };

        info!(flow_id, container = %binding.name, local_id = %binding.local_id, "Container ready");
        Ok(ContainerHandle::from_binding(flow_id, &binding))
    }

    async fn remove_unbound(&self, local_id: &str) {
        if let Err(e) = self.inner.runtime.stop(local_id).await {
            debug!(local_id, error = %e, "Stop of unbound container failed");
        }
        if let Err(e) = self.inner.runtime.remove(local_id).await {
            warn!(local_id, error = %e, "Failed to remove unbound container");
        }
    }

    /// Stop and remove a container.
    ///
    /// Each container is torn down at most once; later calls are no-ops. A
    /// container that is already gone counts as success.
    pub async fn destroy(&self, handle: &ContainerHandle) -> Result<(), ContainerError> {
        if !self.mark_destroyed(&handle.local_id) {
            debug!(flow_id = handle.flow_id, container = %handle.name, "Container already torn down");
            return Ok(());
        }

        info!(flow_id = handle.flow_id, container = %handle.name, "Tearing down container");
        match self.inner.runtime.stop(&handle.local_id).await {
            Ok(()) => {}
            Err(ContainerError::NotFound { .. }) => {
                warn!(flow_id = handle.flow_id, container = %handle.name, "Container already gone");
            }
            Err(e) => {
                warn!(flow_id = handle.flow_id, container = %handle.name, error = %e, "Failed to stop container, removing anyway");
            }
        }

        let removed = match self.inner.runtime.remove(&handle.local_id).await {
            Ok(()) => Ok(()),
            Err(ContainerError::NotFound { .. }) => {
                debug!(flow_id = handle.flow_id, container = %handle.name, "Container already removed");
                Ok(())
            }
            Err(e) => Err(e),
        };

        if let Err(e) = self
            .inner
            .store
            .update_container_status(handle.binding_id, ContainerStatus::Stopped)
            .await
        {
            warn!(flow_id = handle.flow_id, container = %handle.name, error = %e, "Failed to record container stop");
        }
        self.inner
            .creation_locks
            .remove_if(&handle.flow_id, |_, held| Arc::strong_count(held) == 1);

        removed
    }

    /// Tear a container down in the background.
    ///
    /// The teardown is tracked and always runs to completion; [`shutdown`]
    /// waits for it. Failures are logged.
    ///
    /// [`shutdown`]: ContainerManager::shutdown
    pub fn destroy_detached(&self, handle: ContainerHandle) {
        let manager = self.clone();
        self.inner.teardowns.spawn(async move {
            if let Err(e) = manager.destroy(&handle).await {
                warn!(flow_id = handle.flow_id, container = %handle.name, error = %e, "Container teardown failed");
            }
        });
    }

    /// Issue a detached teardown for the flow's bound container, if it has a
    /// live one. Returns whether a teardown was issued.
    pub fn teardown_flow(&self, flow: &Flow) -> bool {
        match &flow.container {
            Some(binding)
                if binding.status == ContainerStatus::Running
                    && !self.is_destroyed(&binding.local_id) =>
            {
                self.destroy_detached(ContainerHandle::from_binding(flow.id, binding));
                true
            }
            _ => false,
        }
    }

    /// Whether the bound container is up. Engine errors count as not running.
    pub async fn is_running(&self, binding: &ContainerBinding) -> bool {
        if binding.status != ContainerStatus::Running || self.is_destroyed(&binding.local_id) {
            return false;
        }
        matches!(
            self.inner.runtime.status(&binding.local_id).await,
            Ok(RuntimeStatus::Running)
        )
    }

    /// Wait for every issued teardown to finish.
    pub async fn shutdown(&self) {
        self.inner.teardowns.close();
        self.inner.teardowns.wait().await;
    }

    fn destroyed(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner
            .destroyed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_destroyed(&self, local_id: &str) -> bool {
        self.destroyed().contains(local_id)
    }

    /// Returns false when the container was already marked.
    fn mark_destroyed(&self, local_id: &str) -> bool {
        self.destroyed().insert(local_id.to_string())
    }
}
