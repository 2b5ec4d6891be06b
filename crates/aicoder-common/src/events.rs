//! Notifications fanned out to live subscribers.

use serde::{Deserialize, Serialize};

use crate::models::{Browser, Flow, LogLine, Task};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskAdded,
    TaskUpdated,
    FlowUpdated,
    TerminalLogAdded,
    BrowserUpdated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskAdded => "task_added",
            Self::TaskUpdated => "task_updated",
            Self::FlowUpdated => "flow_updated",
            Self::TerminalLogAdded => "terminal_log_added",
            Self::BrowserUpdated => "browser_updated",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    TaskAdded { task: Task },
    TaskUpdated { task: Task },
    FlowUpdated { flow: Flow },
    TerminalLogAdded { log: LogLine },
    BrowserUpdated { flow_id: i64, browser: Browser },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TaskAdded { .. } => EventKind::TaskAdded,
            Self::TaskUpdated { .. } => EventKind::TaskUpdated,
            Self::FlowUpdated { .. } => EventKind::FlowUpdated,
            Self::TerminalLogAdded { .. } => EventKind::TerminalLogAdded,
            Self::BrowserUpdated { .. } => EventKind::BrowserUpdated,
        }
    }

    /// The flow this event belongs to.
    pub fn flow_id(&self) -> i64 {
        match self {
            Self::TaskAdded { task } | Self::TaskUpdated { task } => task.flow_id,
            Self::FlowUpdated { flow } => flow.id,
            Self::TerminalLogAdded { log } => log.flow_id,
            Self::BrowserUpdated { flow_id, .. } => *flow_id,
        }
    }
}

/// Subscription key: one event kind, either for a single flow or for every flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    pub flow_id: Option<i64>,
    pub kind: EventKind,
}

impl Topic {
    pub fn flow(flow_id: i64, kind: EventKind) -> Self {
        Self {
            flow_id: Some(flow_id),
            kind,
        }
    }

    /// Matches `kind` events from every flow.
    pub fn any_flow(kind: EventKind) -> Self {
        Self {
            flow_id: None,
            kind,
        }
    }

    /// The exact topic an event is published on.
    pub fn of(event: &Event) -> Self {
        Self::flow(event.flow_id(), event.kind())
    }
}
