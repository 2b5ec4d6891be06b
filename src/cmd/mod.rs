//! CLI command implementations.
//!
//! | Module   | Commands handled            |
//! |----------|-----------------------------|
//! | `models` | `Models`                    |
//! | `flows`  | `Flows`, `Flow`, `Finish`   |
//! | `run`    | `Run`, `Resume`             |

pub mod flows;
pub mod models;
pub mod run;

pub use flows::{cmd_finish, cmd_flow, cmd_flows};
pub use models::cmd_models;
pub use run::{cmd_resume, cmd_run};

use std::path::Path;
use std::sync::Arc;

use aicoder::Orchestrator;
use aicoder::config::Config;
use aicoder::container::DockerRuntime;
use aicoder::executor::SandboxExecutor;
use aicoder::store::SqliteStore;
use aicoder_common::{FlowStatus, TaskStatus};
use anyhow::Result;
use console::StyledObject;

/// Load config from `--config` or the project directory, then apply env overrides.
pub fn load_config(project_dir: &Path, config_path: Option<&Path>) -> Result<Config> {
    let mut config = match config_path {
        Some(path) => Config::load_file(project_dir, path)?,
        None => Config::load(project_dir)?,
    };
    config.apply_env()?;
    Ok(config)
}

/// Wire the orchestrator against SQLite and the local Docker daemon.
pub fn open_orchestrator(config: Config) -> Result<Orchestrator> {
    let store = Arc::new(SqliteStore::open(&config.database.path)?);
    let runtime = Arc::new(DockerRuntime::connect(&config.sandbox)?);
    Ok(Orchestrator::new(
        config,
        store,
        runtime,
        Arc::new(SandboxExecutor::new()),
    ))
}

pub fn flow_status(status: FlowStatus) -> StyledObject<&'static str> {
    let styled = console::style(status.as_str());
    match status {
        FlowStatus::InProgress => styled.cyan(),
        FlowStatus::Finished => styled.green(),
        FlowStatus::Error => styled.red(),
    }
}

pub fn task_status(status: TaskStatus) -> StyledObject<&'static str> {
    let styled = console::style(status.as_str());
    match status {
        TaskStatus::Pending => styled.dim(),
        TaskStatus::Running => styled.yellow(),
        TaskStatus::Finished => styled.green(),
        TaskStatus::Error => styled.red(),
    }
}
