//! The final diagnostic report.
//!
//! For each selected variant: a pass/fail banner, the variant body with
//! changed lines highlighted against the original test, and the
//! execution-path diff cropped to the neighborhoods where the traces
//! actually differ.

use colored::Colorize;
use similar::{ChangeTag, TextDiff};

use crate::trace::{classify_line, RawTraceLine};

/// One selected variant, ready to render.
#[derive(Debug, Clone)]
pub struct ReportEntry<'a> {
    pub name: &'a str,
    pub passed: bool,
    pub body: &'a str,
    pub trace: &'a str,
}

/// Lines of context shown around each trace change.
const TRACE_CONTEXT: usize = 2;

/// Render the whole report: failing variants after passing ones, closest
/// first within each group.
pub fn render_report(
    passing: &[ReportEntry<'_>],
    failing: &[ReportEntry<'_>],
    original_body: &str,
    original_trace: &str,
) -> String {
    let mut out = String::new();
    for entry in passing.iter().chain(failing.iter()) {
        let banner = if entry.passed {
            format!("{} PASSING TEST {}", "/".repeat(24), "/".repeat(24))
                .green()
                .to_string()
        } else {
            format!("{} FAILING TEST {}", "/".repeat(24), "/".repeat(24))
                .red()
                .to_string()
        };
        out.push_str(&banner);
        out.push('\n');
        out.push_str(&format!("Variant: {}\n", entry.name));
        out.push_str(
            &format!("{} Test Content Changes {}", "~".repeat(16), "~".repeat(16))
                .blue()
                .to_string(),
        );
        out.push('\n');
        out.push_str(&render_body_diff(original_body, entry.body));
        out.push_str(
            &format!("{} Execution Path Changes {}", "~".repeat(16), "~".repeat(16))
                .blue()
                .to_string(),
        );
        out.push('\n');
        out.push_str(&render_trace_diff(original_trace, entry.trace));
        out.push('\n');
    }
    out
}

/// The variant body with lines that differ from the original marked and
/// highlighted. Removed original lines are not shown; the marker on the
/// following line points at where they were.
fn render_body_diff(original_body: &str, variant_body: &str) -> String {
    let diff = TextDiff::from_lines(original_body, variant_body);
    let mut out = String::new();
    for change in diff.iter_all_changes() {
        let line = change.value().trim_end_matches('\n');
        match change.tag() {
            ChangeTag::Equal => {
                out.push_str("  ");
                out.push_str(line);
                out.push('\n');
            }
            ChangeTag::Insert => {
                out.push_str(&"* ".blue().to_string());
                out.push_str(&line.green().to_string());
                out.push('\n');
            }
            ChangeTag::Delete => {}
        }
    }
    out
}

/// Trace diff with per-line coloring, cropped so that only the changed
/// neighborhoods remain. Line logs are compared by their content only; the
/// `<file>.<ext>(<lineno>):` prefix moves with every literal edit and would
/// drown the diff in noise.
fn render_trace_diff(original_trace: &str, variant_trace: &str) -> String {
    let old = strip_linelog_prefixes(original_trace);
    let new = strip_linelog_prefixes(variant_trace);
    let diff = TextDiff::from_lines(old.as_str(), new.as_str());

    let mut lines: Vec<String> = Vec::new();
    let mut changed: Vec<bool> = Vec::new();
    for change in diff.iter_all_changes() {
        let line = change.value().trim_end_matches('\n');
        match change.tag() {
            ChangeTag::Equal => {
                lines.push(line.to_string());
                changed.push(false);
            }
            ChangeTag::Insert => {
                lines.push(line.green().to_string());
                changed.push(true);
            }
            ChangeTag::Delete => {
                lines.push(format!(" (Line removed: {})", line).red().to_string());
                changed.push(true);
            }
        }
    }

    let mut out = String::new();
    let mut last_emitted: Option<usize> = None;
    for (index, line) in lines.iter().enumerate() {
        let near_change = changed
            [index.saturating_sub(TRACE_CONTEXT)..(index + TRACE_CONTEXT + 1).min(changed.len())]
            .iter()
            .any(|c| *c);
        if !near_change {
            continue;
        }
        if last_emitted.is_none_or(|prev| prev + 1 != index) {
            out.push_str(" (...)\n");
        }
        out.push_str(line);
        out.push('\n');
        last_emitted = Some(index);
    }
    if last_emitted.is_none_or(|prev| prev + 1 != lines.len()) {
        out.push_str(" (...)\n");
    }
    out
}

fn strip_linelog_prefixes(trace: &str) -> String {
    trace
        .split('\n')
        .map(|line| match classify_line(line).0 {
            RawTraceLine::LineLog { content, .. } => content,
            _ => line.to_string(),
        })
        .collect::<Vec<String>>()
        .join("\n")
}
