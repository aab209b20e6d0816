//! Human-readable rendering of run events and error chains, independent
//! of the structured JSON the event stream emits on the wire.

use crate::diagnostics::ErrorEvent;
use crate::event_bus::Event;

pub const CONTEXT_COLOR: &str = "\x1b[32m"; // green
pub const LINE_COLOR: &str = "\x1b[35m"; // magenta
pub const RESET_COLOR: &str = "\x1b[0m";

/// Rendered output for a telemetry item, ready for a sink to write out.
#[derive(Clone, Debug, Default)]
pub struct EventRender {
    pub context: Option<String>,
    pub lines: Vec<String>,
}

impl EventRender {
    pub fn join_lines(&self) -> String {
        self.lines.join("")
    }
}

/// Whether ANSI color codes are included in rendered output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FormatterMode {
    /// Auto-detect TTY capability (checks stderr).
    #[default]
    Auto,
    /// Always include color codes.
    Colored,
    /// Never include color codes.
    Plain,
}

impl FormatterMode {
    fn colors_enabled(self) -> bool {
        match self {
            FormatterMode::Colored => true,
            FormatterMode::Plain => false,
            FormatterMode::Auto => is_stderr_tty(),
        }
    }
}

fn is_stderr_tty() -> bool {
    use std::io::IsTerminal;
    std::io::stderr().is_terminal()
}

pub trait TelemetryFormatter: Send + Sync {
    fn render_event(&self, event: &Event) -> EventRender;
    fn render_errors(&self, errors: &[ErrorEvent]) -> Vec<EventRender>;
}

pub struct PlainFormatter {
    mode: FormatterMode,
}

impl Default for PlainFormatter {
    fn default() -> Self {
        Self {
            mode: FormatterMode::Auto,
        }
    }
}

impl PlainFormatter {
    pub fn with_mode(mode: FormatterMode) -> Self {
        Self { mode }
    }

    fn paint(&self, color: &str, text: &str) -> String {
        if self.mode.colors_enabled() {
            format!("{color}{text}{RESET_COLOR}")
        } else {
            text.to_string()
        }
    }
}

fn format_error_chain(
    formatter: &PlainFormatter,
    error: &crate::diagnostics::LadderError,
    indent: usize,
) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(cause) = &error.cause {
        let indent_str = "  ".repeat(indent);
        lines.push(format!(
            "{}\n",
            formatter.paint(LINE_COLOR, &format!("{indent_str}cause: {}", cause.message))
        ));
        lines.extend(format_error_chain(formatter, cause, indent + 1));
    }
    lines
}

impl TelemetryFormatter for PlainFormatter {
    fn render_event(&self, event: &Event) -> EventRender {
        let line = format!("{}\n", self.paint(LINE_COLOR, &event.to_string()));
        EventRender {
            context: event.scope_label().map(str::to_string),
            lines: vec![line],
        }
    }

    fn render_errors(&self, errors: &[ErrorEvent]) -> Vec<EventRender> {
        errors
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let mut lines = Vec::new();
                let scope_str = self.paint(CONTEXT_COLOR, &format!("{:?}", e.scope));
                lines.push(format!("[{}] {} | {}\n", i, e.when, scope_str));
                lines.push(format!(
                    "{}\n",
                    self.paint(LINE_COLOR, &format!("  error: {}", e.error.message))
                ));
                lines.extend(format_error_chain(self, &e.error, 1));
                if !e.tags.is_empty() {
                    lines.push(format!(
                        "{}\n",
                        self.paint(LINE_COLOR, &format!("  tags: {:?}", e.tags))
                    ));
                }
                if !e.context.is_null() {
                    lines.push(format!(
                        "{}\n",
                        self.paint(LINE_COLOR, &format!("  context: {}", e.context))
                    ));
                }
                EventRender {
                    context: Some(format!("{:?}", e.scope)),
                    lines,
                }
            })
            .collect()
    }
}
