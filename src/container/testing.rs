//! In-memory container runtime for unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{ContainerRuntime, ContainerSpec, ExecOutput, RuntimeStatus};
use crate::errors::ContainerError;

/// Tracks containers in a map. `exec` echoes the shell script back and
/// `exit N` scripts report exit status N.
#[derive(Default)]
pub struct FakeRuntime {
    pub containers: Mutex<HashMap<String, RuntimeStatus>>,
    pub creates: AtomicUsize,
    pub stops: AtomicUsize,
    pub removes: AtomicUsize,
    pub fail_create: AtomicBool,
}

impl FakeRuntime {
    pub fn failing() -> Self {
        let runtime = Self::default();
        runtime.fail_create.store(true, Ordering::SeqCst);
        runtime
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    /// Make a container disappear behind the manager's back.
    pub fn vanish(&self, local_id: &str) {
        self.containers.lock().unwrap().remove(local_id);
    }

    pub fn live(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    fn not_found(local_id: &str) -> ContainerError {
        ContainerError::NotFound {
            container: local_id.to_string(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ContainerError::Runtime(anyhow::anyhow!(
                "image {} not found",
                spec.image
            )));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        let n = self.creates.fetch_add(1, Ordering::SeqCst);
        let id = format!("{}-{}", spec.name, n);
        self.containers
            .lock()
            .unwrap()
            .insert(id.clone(), RuntimeStatus::Running);
        Ok(id)
    }

    async fn stop(&self, local_id: &str) -> Result<(), ContainerError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        match self.containers.lock().unwrap().get_mut(local_id) {
            Some(status) => {
                *status = RuntimeStatus::Stopped;
                Ok(())
            }
            None => Err(Self::not_found(local_id)),
        }
    }

    async fn remove(&self, local_id: &str) -> Result<(), ContainerError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        match self.containers.lock().unwrap().remove(local_id) {
            Some(_) => Ok(()),
            None => Err(Self::not_found(local_id)),
        }
    }

    async fn status(&self, local_id: &str) -> Result<RuntimeStatus, ContainerError> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .get(local_id)
            .copied()
            .unwrap_or(RuntimeStatus::Absent))
    }

    async fn exec(&self, local_id: &str, cmd: &[String]) -> Result<ExecOutput, ContainerError> {
        if self.status(local_id).await? != RuntimeStatus::Running {
            return Err(Self::not_found(local_id));
        }
        let script = cmd.last().cloned().unwrap_or_default();
        let exit_code = script
            .strip_prefix("exit ")
            .and_then(|n| n.trim().parse().ok())
            .unwrap_or(0);
        Ok(ExecOutput {
            exit_code,
            output: format!("ran: {}\n", script),
        })
    }
}
