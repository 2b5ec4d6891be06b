//! Rendering of terminal log lines for xterm-style clients.

use aicoder_common::{LogKind, LogLine};

const PROMPT: &str = "\x1b[1;33m$\x1b[0m ";

/// Render a command the user or agent typed: prompt prefix, CRLF terminated.
pub fn format_input(text: &str) -> String {
    format!("{}{}\r\n", PROMPT, crlf(text.trim_end()))
}

/// Render command output with CRLF line endings.
pub fn format_output(text: &str) -> String {
    let mut rendered = crlf(text);
    if !rendered.is_empty() && !rendered.ends_with("\r\n") {
        rendered.push_str("\r\n");
    }
    rendered
}

/// Render a stored log line according to its kind.
pub fn render(log: &LogLine) -> String {
    match log.kind {
        LogKind::Input => format_input(&log.text),
        LogKind::Output => format_output(&log.text),
    }
}

fn crlf(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}
