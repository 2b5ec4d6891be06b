//! Running flows from the command line.

use std::collections::HashSet;
use std::time::Duration;

use aicoder::bus::Subscription;
use aicoder::config::Config;
use aicoder_common::{Event, EventKind, FlowStatus, ModelRef, TaskKind};
use anyhow::Result;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{flow_status, open_orchestrator, task_status};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub async fn cmd_run(
    config: Config,
    provider: &str,
    model: &str,
    prompts: &[String],
    commands: &[String],
) -> Result<()> {
    if prompts.is_empty() && commands.is_empty() {
        anyhow::bail!("Nothing to run: pass at least one prompt or --command");
    }

    let orchestrator = open_orchestrator(config)?;
    let flow = orchestrator
        .create_flow(ModelRef::new(provider, model))
        .await?;
    println!(
        "{} Flow {} started with {}/{}",
        console::style("▶").cyan(),
        flow.id,
        flow.model.provider,
        flow.model.id
    );

    let ctx = CancellationToken::new();
    let mut updates = orchestrator.subscribe(flow.id, EventKind::TaskUpdated, &ctx);
    let mut terminal = orchestrator.subscribe(flow.id, EventKind::TerminalLogAdded, &ctx);
    let mut flow_updates = orchestrator.subscribe(flow.id, EventKind::FlowUpdated, &ctx);

    let mut outstanding = HashSet::new();
    for prompt in prompts {
        let task = orchestrator.create_task(flow.id, prompt).await?;
        outstanding.insert(task.id);
    }
    for command in commands {
        let task = orchestrator
            .enqueue_task(
                flow.id,
                TaskKind::Command,
                command,
                json!({ "command": command }),
            )
            .await?;
        outstanding.insert(task.id);
    }

    let mut poll = tokio::time::interval(POLL_INTERVAL);
    while !outstanding.is_empty() {
        tokio::select! {
            Some(Event::TaskUpdated { task }) = updates.recv() => {
                println!(
                    "  task {} ({}) {}",
                    task.id,
                    task.kind.as_str(),
                    task_status(task.status)
                );
                if task.status.is_terminal() {
                    outstanding.remove(&task.id);
                }
            }
            Some(Event::TerminalLogAdded { log }) = terminal.recv() => {
                print!("{}", log.text.replace("\r\n", "\n"));
            }
            Some(Event::FlowUpdated { flow }) = flow_updates.recv() => {
                if flow.status == FlowStatus::Error {
                    println!("{} Flow {} failed", console::style("✗").red(), flow.id);
                    break;
                }
            }
            // Events can be dropped for a slow reader; reconcile from the store.
            _ = poll.tick() => {
                let detail = orchestrator.flow(flow.id).await?;
                for task in detail.tasks.iter().filter(|t| t.status.is_terminal()) {
                    outstanding.remove(&task.id);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted");
                break;
            }
        }
    }
    ctx.cancel();

    let flow = orchestrator.finish_flow(flow.id).await?;
    orchestrator.shutdown().await;
    println!(
        "{} Flow {} is {}",
        console::style("■").dim(),
        flow.id,
        flow_status(flow.status)
    );
    Ok(())
}

pub async fn cmd_resume(config: Config) -> Result<()> {
    let orchestrator = open_orchestrator(config)?;
    let ctx = CancellationToken::new();
    let mut updates = orchestrator.subscribe_all(EventKind::TaskUpdated, &ctx);

    let resumed = orchestrator.resume().await?;
    println!("Resumed {} flow(s). Press Ctrl-C to stop.", resumed);
    if resumed == 0 {
        orchestrator.shutdown().await;
        return Ok(());
    }

    print_updates(&mut updates).await;
    ctx.cancel();
    orchestrator.shutdown().await;
    Ok(())
}

async fn print_updates(updates: &mut Subscription) {
    loop {
        tokio::select! {
            event = updates.recv() => match event {
                Some(Event::TaskUpdated { task }) => println!(
                    "  flow {} task {} ({}) {}",
                    task.flow_id,
                    task.id,
                    task.kind.as_str(),
                    task_status(task.status)
                ),
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping; pending tasks stay queued for the next resume.");
                break;
            }
        }
    }
}
