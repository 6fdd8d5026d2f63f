//! Execution trace reconstruction.
//!
//! The execution environment emits a flat, line-oriented trace: function
//! entry markers and per-statement line logs, but no exit markers. This
//! module rebuilds the call structure by classifying each line, resolving
//! which function/class contains each logged statement, and synthesizing
//! exit markers wherever control must have left a frame. Every synthesized
//! exit pops an explicit call stack and must match the frame being closed;
//! a mismatch means the trace violates the format assumptions and is fatal.

pub mod distance;

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error(
        "stack discipline violated: exiting {module}.{func} but the innermost open frame is {top}"
    )]
    StackDiscipline {
        module: String,
        func: String,
        top: String,
    },
    #[error("no entry into {module}.{func} found in trace")]
    MissingEntry { module: String, func: String },
    #[error("no exit from {module}.{func} found in trace")]
    MissingExit { module: String, func: String },
}

/// One classified line of raw trace output.
#[derive(Debug, Clone, PartialEq)]
pub enum RawTraceLine {
    Blank,
    /// ` --- modulename: <mod>, funcname: <func>`
    FunctionCall { module: String, func: String },
    /// `<file>.<ext>(<lineno>): <content>`
    LineLog {
        file: String,
        module: String,
        line_no: usize,
        content: String,
    },
    /// Anything else (interleaved print output and the like); passed through.
    Other,
}

const CALL_MARKER: &str = " --- modulename: ";
const FUNC_MARKER: &str = ", funcname: ";
const EXIT_MARKER: &str = " ||| exiting modulename: ";

/// Classify a raw line. Lines that fit no known shape are warned about and
/// preserved untouched.
pub fn classify_line(line: &str) -> (RawTraceLine, String) {
    if line.is_empty() {
        return (RawTraceLine::Blank, String::new());
    }
    if let Some(call_at) = line.find(CALL_MARKER) {
        let rest = &line[call_at + CALL_MARKER.len()..];
        if let Some(func_at) = rest.find(FUNC_MARKER) {
            let module = rest[..func_at].to_string();
            let func = rest[func_at + FUNC_MARKER.len()..].trim().to_string();
            let display = line[call_at..].to_string();
            return (RawTraceLine::FunctionCall { module, func }, display);
        }
    }
    if let Some((file, line_no, content, display)) = parse_linelog(line) {
        let module = file
            .rsplit_once('.')
            .map(|(stem, _)| stem.to_string())
            .unwrap_or_else(|| file.clone());
        return (
            RawTraceLine::LineLog {
                file,
                module,
                line_no,
                content,
            },
            display,
        );
    }
    tracing::warn!("trace line fits no known shape (passed through): {}", line);
    (RawTraceLine::Other, line.to_string())
}

/// Find the last `<file>.<ext>(<digits>):` shape in the line. Anything before
/// the file token (timestamps, thread tags) is trimmed away.
fn parse_linelog(line: &str) -> Option<(String, usize, String, String)> {
    let bytes = line.as_bytes();
    let mut candidate: Option<(usize, usize, usize)> = None; // (open, close, colon)
    for (open, _) in line.match_indices('(') {
        let Some(close_rel) = line[open + 1..].find(')') else {
            continue;
        };
        let close = open + 1 + close_rel;
        let digits = &line[open + 1..close];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if bytes.get(close + 1) != Some(&b':') {
            continue;
        }
        // The file token must carry an extension.
        let before = &line[..open];
        let token_start = before
            .rfind(char::is_whitespace)
            .map(|i| i + 1)
            .unwrap_or(0);
        if !before[token_start..].contains('.') {
            continue;
        }
        candidate = Some((open, close, close + 1));
    }
    let (open, close, colon) = candidate?;
    let before = &line[..open];
    let token_start = before
        .rfind(char::is_whitespace)
        .map(|i| i + 1)
        .unwrap_or(0);
    let file = before[token_start..].to_string();
    let line_no: usize = line[open + 1..close].parse().ok()?;
    let after = &line[colon + 1..];
    let content = after.strip_prefix(' ').unwrap_or(after).to_string();
    let display = line[token_start..].to_string();
    Some((file, line_no, content, display))
}

/// Render a synthesized exit marker.
pub fn exit_line(module: &str, func: &str) -> String {
    format!("{}{}{}{}", EXIT_MARKER, module, FUNC_MARKER, func)
}

/// Read-through cache of source files, keyed by file name with extension.
/// Populated on first read and never invalidated within a run.
pub struct SourceCache {
    search_roots: Vec<PathBuf>,
    files: HashMap<String, Option<Vec<String>>>,
}

impl SourceCache {
    pub fn new(search_roots: Vec<PathBuf>) -> Self {
        Self {
            search_roots,
            files: HashMap::new(),
        }
    }

    /// Pre-populate an entry, bypassing the filesystem.
    pub fn seed(&mut self, file_name: &str, content: &str) {
        self.files.insert(
            file_name.to_string(),
            Some(content.lines().map(|l| l.to_string()).collect()),
        );
    }

    pub fn lines(&mut self, file_name: &str) -> Option<&[String]> {
        if !self.files.contains_key(file_name) {
            let loaded = self.load(file_name);
            if loaded.is_none() {
                tracing::warn!("source file '{}' not found under any search root", file_name);
            }
            self.files.insert(file_name.to_string(), loaded);
        }
        self.files.get(file_name).and_then(|cached| cached.as_deref())
    }

    fn load(&self, file_name: &str) -> Option<Vec<String>> {
        for root in &self.search_roots {
            let direct = root.join(file_name);
            if direct.is_file() {
                if let Ok(content) = std::fs::read_to_string(&direct) {
                    return Some(content.lines().map(|l| l.to_string()).collect());
                }
            }
            for entry in WalkDir::new(root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'))
                .flatten()
            {
                if entry.file_type().is_file()
                    && entry.file_name().to_string_lossy() == file_name
                {
                    if let Ok(content) = std::fs::read_to_string(entry.path()) {
                        return Some(content.lines().map(|l| l.to_string()).collect());
                    }
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone)]
struct Frame {
    module: String,
    func: String,
    interesting: bool,
}

/// All state for one reconstruction run: the open-frame stack, the source
/// cache, the container memo, and the interest predicate. Instance-scoped;
/// nothing here outlives the run.
pub struct ReconstructionContext<'a> {
    cache: &'a mut SourceCache,
    is_interesting: Box<dyn Fn(&str) -> bool + 'a>,
    stack: Vec<Frame>,
    containers: HashMap<(String, usize, bool), String>,
}

impl<'a> ReconstructionContext<'a> {
    pub fn new(
        cache: &'a mut SourceCache,
        is_interesting: impl Fn(&str) -> bool + 'a,
    ) -> Self {
        Self {
            cache,
            is_interesting: Box::new(is_interesting),
            stack: Vec::new(),
            containers: HashMap::new(),
        }
    }

    /// Modules of the frames still open (outermost first). Empty when the
    /// trace closed every frame it opened.
    pub fn open_frames(&self) -> Vec<(String, String)> {
        self.stack
            .iter()
            .map(|f| (f.module.clone(), f.func.clone()))
            .collect()
    }

    fn push(&mut self, module: &str, func: &str) {
        let interesting = (self.is_interesting)(module);
        self.stack.push(Frame {
            module: module.to_string(),
            func: func.to_string(),
            interesting,
        });
    }

    fn any_frame_interesting(&self) -> bool {
        self.stack.iter().any(|f| f.interesting)
    }

    /// Pop the stack for a synthesized exit and verify the frame matches.
    fn pop_expecting(&mut self, module: &str, func: &str) -> Result<(), TraceError> {
        match self.stack.pop() {
            Some(frame) if frame.module == module && frame.func == func => Ok(()),
            Some(frame) => Err(TraceError::StackDiscipline {
                module: module.to_string(),
                func: func.to_string(),
                top: format!("{}.{}", frame.module, frame.func),
            }),
            None => Err(TraceError::StackDiscipline {
                module: module.to_string(),
                func: func.to_string(),
                top: "<empty stack>".to_string(),
            }),
        }
    }

    /// Innermost function/class containing `line_no` of `file`, found by
    /// walking upward to the nearest def/class line with strictly fewer
    /// leading whitespace characters. A def/class line is its own container
    /// unless `def_counts_as_next` is set. Missing or short sources resolve
    /// to `<module>`.
    fn innermost_container(&mut self, file: &str, line_no: usize, def_counts_as_next: bool) -> String {
        let key = (file.to_string(), line_no, def_counts_as_next);
        if let Some(cached) = self.containers.get(&key) {
            return cached.clone();
        }
        let container = self.compute_container(file, line_no, def_counts_as_next);
        self.containers.insert(key, container.clone());
        container
    }

    fn compute_container(&mut self, file: &str, line_no: usize, def_counts_as_next: bool) -> String {
        let Some(lines) = self.cache.lines(file) else {
            return "<module>".to_string();
        };
        let index = line_no.saturating_sub(1);
        let Some(line) = lines.get(index) else {
            return "<module>".to_string();
        };
        if !def_counts_as_next {
            if let Some(name) = definition_name(line) {
                return name;
            }
        }
        let indent = leading_whitespace(line);
        for above in lines[..index].iter().rev() {
            if leading_whitespace(above) < indent {
                if let Some(name) = definition_name(above) {
                    return name;
                }
            }
        }
        "<module>".to_string()
    }
}

fn leading_whitespace(line: &str) -> usize {
    line.chars().take_while(|c| *c == ' ' || *c == '\t').count()
}

/// `def foo(...)` or `class Foo(...)`/`class Foo:` -> the defined name.
fn definition_name(line: &str) -> Option<String> {
    let trimmed = line.trim_start_matches([' ', '\t']);
    if let Some(rest) = trimmed.strip_prefix("def ") {
        let end = rest.find('(').unwrap_or(rest.len());
        return Some(rest[..end].trim().to_string());
    }
    if let Some(rest) = trimmed.strip_prefix("class ") {
        let end = rest
            .find(['(', ':'])
            .unwrap_or(rest.len());
        return Some(rest[..end].trim().to_string());
    }
    None
}

fn is_definition_line(content: &str) -> bool {
    let trimmed = content.trim_start_matches([' ', '\t']);
    trimmed.starts_with("def ") || trimmed.starts_with("class ")
}

fn parens_balanced(content: &str) -> bool {
    content.matches('(').count() == content.matches(')').count()
}

/// Output of one reconstruction pass.
#[derive(Debug)]
pub struct ReconstructedTrace {
    /// The trace with synthesized exit markers inserted.
    pub text: String,
    /// Indices (into the reconstructed line list) of line logs executed
    /// while at least one interesting frame was open.
    pub interesting_indices: Vec<usize>,
    /// Every module name observed in entry markers or line logs.
    pub modules_seen: BTreeSet<String>,
}

/// Insert exit markers into a raw trace. One sequential pass with one line
/// of lookahead; see the rules on each branch below.
pub fn add_exit_lines(
    raw: &str,
    ctx: &mut ReconstructionContext<'_>,
) -> Result<ReconstructedTrace, TraceError> {
    let raw_lines: Vec<&str> = raw.split('\n').collect();
    let parsed: Vec<(RawTraceLine, String)> =
        raw_lines.iter().map(|l| classify_line(l)).collect();

    let mut out: Vec<String> = Vec::new();
    let mut interesting_indices: Vec<usize> = Vec::new();
    let mut modules_seen: BTreeSet<String> = BTreeSet::new();

    for current_index in 0..parsed.len() {
        let (line, display) = &parsed[current_index];
        out.push(display.clone());

        match line {
            RawTraceLine::FunctionCall { module, func } => {
                modules_seen.insert(module.clone());
                ctx.push(module, func);
            }
            RawTraceLine::LineLog { module, .. } => {
                modules_seen.insert(module.clone());
                if ctx.any_frame_interesting() {
                    interesting_indices.push(out.len() - 1);
                }
            }
            RawTraceLine::Blank | RawTraceLine::Other => {}
        }

        let Some((next, _)) = parsed.get(current_index + 1) else {
            continue;
        };

        match (line, next) {
            // Both lines are line logs in different containers: the earlier
            // frame(s) returned without a further call. Skipped when one
            // line is a nested definition immediately contained by the
            // other, or both are definition lines.
            (
                RawTraceLine::LineLog {
                    file: cur_file,
                    line_no: cur_no,
                    content: cur_content,
                    ..
                },
                RawTraceLine::LineLog {
                    file: next_file,
                    line_no: next_no,
                    content: next_content,
                    ..
                },
            ) => {
                let cur_container = ctx.innermost_container(cur_file, *cur_no, false);
                let next_container = ctx.innermost_container(next_file, *next_no, false);
                let differs = next_container != cur_container
                    || (next_container == "<module>"
                        && cur_container == "<module>"
                        && next_file != cur_file);
                if !differs {
                    continue;
                }
                let nested_definition = (is_definition_line(next_content)
                    && ctx.innermost_container(next_file, *next_no, true) == cur_container)
                    || (is_definition_line(cur_content)
                        && ctx.innermost_container(cur_file, *cur_no, true) == next_container);
                let both_definitions =
                    is_definition_line(cur_content) && is_definition_line(next_content);
                if nested_definition || both_definitions {
                    continue;
                }
                while let Some(top) = ctx.stack.last().cloned() {
                    if top.func == next_container {
                        break;
                    }
                    ctx.pop_expecting(&top.module, &top.func)?;
                    out.push(exit_line(&top.module, &top.func));
                }
            }
            // An explicit `return` statement followed by a call: the
            // returning frame exits before the call is entered.
            (
                RawTraceLine::LineLog { content, .. },
                RawTraceLine::FunctionCall { .. },
            ) => {
                let trimmed = content.trim_start_matches([' ', '\t']);
                if trimmed.starts_with("return ") && parens_balanced(content) {
                    if let Some(top) = ctx.stack.last().cloned() {
                        ctx.pop_expecting(&top.module, &top.func)?;
                        out.push(exit_line(&top.module, &top.func));
                    }
                }
            }
            // A call entry immediately followed by a line log somewhere
            // else: the called function entered and left without executing
            // a single body line.
            (
                RawTraceLine::FunctionCall { module, func },
                RawTraceLine::LineLog {
                    file: next_file,
                    module: next_module,
                    line_no: next_no,
                    ..
                },
            ) => {
                if module != next_module {
                    let next_container = ctx.innermost_container(next_file, *next_no, false);
                    if *func != next_container {
                        while let Some(top) = ctx.stack.last().cloned() {
                            if top.func == next_container {
                                break;
                            }
                            ctx.pop_expecting(&top.module, &top.func)?;
                            out.push(exit_line(&top.module, &top.func));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    Ok(ReconstructedTrace {
        text: out.join("\n"),
        interesting_indices,
        modules_seen,
    })
}

/// Drop everything before the first entry into `module.func`.
pub fn crop_before_entry(trace: &str, module: &str, func: &str) -> Result<String, TraceError> {
    let prefix = format!("{}{}{}", CALL_MARKER, module, FUNC_MARKER);
    let lines: Vec<&str> = trace.split('\n').collect();
    let start = lines
        .iter()
        .position(|l| l.starts_with(&prefix) && l[prefix.len()..].trim() == func)
        .ok_or_else(|| TraceError::MissingEntry {
            module: module.to_string(),
            func: func.to_string(),
        })?;
    Ok(lines[start..].join("\n"))
}

/// Drop everything after the last exit from `module.func` (the exit line
/// itself is kept).
pub fn crop_after_exit(trace: &str, module: &str, func: &str) -> Result<String, TraceError> {
    let prefix = format!("{}{}{}", EXIT_MARKER, module, FUNC_MARKER);
    let lines: Vec<&str> = trace.split('\n').collect();
    let end = lines
        .iter()
        .rposition(|l| l.starts_with(&prefix) && l[prefix.len()..].trim() == func)
        .ok_or_else(|| TraceError::MissingExit {
            module: module.to_string(),
            func: func.to_string(),
        })?;
    Ok(lines[..=end].join("\n"))
}
