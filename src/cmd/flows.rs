//! Flow listing, inspection and finishing.

use aicoder::config::Config;
use aicoder::store::{SqliteStore, Store};
use anyhow::Result;

use super::{flow_status, open_orchestrator, task_status};

pub async fn cmd_flows(config: &Config) -> Result<()> {
    let store = SqliteStore::open(&config.database.path)?;
    let flows = store.read_all_flows().await?;
    if flows.is_empty() {
        println!();
        println!("No flows yet. Start one with 'aicoder run'.");
        println!();
        return Ok(());
    }

    println!(
        "{:<6} {:<12} {:<20} {:<24} Created",
        "ID", "Status", "Model", "Container"
    );
    println!(
        "{:<6} {:<12} {:<20} {:<24} -------",
        "------", "------------", "--------------------", "------------------------"
    );
    for flow in flows {
        let container = flow
            .container
            .as_ref()
            .map(|c| format!("{} ({})", c.name, c.status.as_str()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<6} {:<12} {:<20} {:<24} {}",
            flow.id,
            flow_status(flow.status),
            format!("{}/{}", flow.model.provider, flow.model.id),
            container,
            flow.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub async fn cmd_flow(config: Config, id: i64) -> Result<()> {
    let orchestrator = open_orchestrator(config)?;
    let detail = orchestrator.flow(id).await?;
    let flow = &detail.flow;

    println!();
    println!(
        "Flow {}: {} [{}]",
        flow.id,
        console::style(&flow.name).bold(),
        flow_status(flow.status)
    );
    println!("Model: {}/{}", flow.model.provider, flow.model.id);
    if let Some(container) = &flow.container {
        println!(
            "Container: {} ({})",
            container.name,
            if detail.terminal_connected {
                console::style("connected").green()
            } else {
                console::style("disconnected").dim()
            }
        );
    }
    println!();

    println!("{:<6} {:<10} {:<10} Message", "Task", "Kind", "Status");
    for task in &detail.tasks {
        println!(
            "{:<6} {:<10} {:<10} {}",
            task.id,
            task.kind.as_str(),
            task_status(task.status),
            task.message
        );
    }

    if !detail.logs.is_empty() {
        println!();
        println!("{}", console::style("Terminal").bold());
        for log in &detail.logs {
            print!("{}", log.text.replace("\r\n", "\n"));
        }
    }
    println!();
    Ok(())
}

pub async fn cmd_finish(config: Config, id: i64) -> Result<()> {
    let orchestrator = open_orchestrator(config)?;
    let flow = orchestrator.finish_flow(id).await?;
    // Wait for the container teardown before the process exits.
    orchestrator.shutdown().await;
    println!("Flow {} is {}", flow.id, flow_status(flow.status));
    Ok(())
}
