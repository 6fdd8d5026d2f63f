//! Test discovery and test-method extraction.
//!
//! The engine never walks the filesystem itself; it consumes the
//! [`SourceScanner`] contract. The default implementation walks a project
//! root for Python test files (basename starts or ends with "test") and
//! lists every test method with its definition line.

use anyhow::{Context, Result};
use glob_match::glob_match;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Where a test method came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOrigin {
    /// Written by a person and discovered in the project.
    Found,
    /// Generated by the fuzzer.
    Fuzzed,
}

/// A test method and everything needed to fuzz, regenerate, and run it.
#[derive(Debug, Clone)]
pub struct TestMethod {
    pub origin: TestOrigin,
    pub file_path: PathBuf,
    /// File stem, which is also the module name in trace output.
    pub module: String,
    /// Enclosing class name, empty for module-level functions.
    pub class_name: String,
    pub name: String,
    /// 1-based line of the `def` statement.
    pub definition_line: usize,
    /// The method's lines, definition included, original indentation kept.
    pub body_lines: Vec<String>,
    /// Module-level import lines of the containing file.
    pub import_lines: Vec<String>,
    pub is_original: bool,
}

impl TestMethod {
    /// The method source with the common leading indentation removed, ready
    /// for parsing as a module-level definition.
    pub fn dedented_source(&self) -> String {
        let mut out = minimize_indents(&self.body_lines).join("\n");
        out.push('\n');
        out
    }

    pub fn qualified_id(&self) -> String {
        if self.class_name.is_empty() {
            format!("{}.{}", self.module, self.name)
        } else {
            format!("{}.{}.{}", self.module, self.class_name, self.name)
        }
    }
}

/// Strip the common leading whitespace of all nonblank lines.
pub fn minimize_indents(lines: &[String]) -> Vec<String> {
    let common = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| leading_whitespace_len(l))
        .min()
        .unwrap_or(0);
    lines
        .iter()
        .map(|l| {
            if l.trim().is_empty() {
                String::new()
            } else {
                l.chars().skip(common).collect()
            }
        })
        .collect()
}

fn leading_whitespace_len(line: &str) -> usize {
    line.chars().take_while(|c| *c == ' ' || *c == '\t').count()
}

/// A discovered test file and its (test name, definition line) pairs.
#[derive(Debug, Clone)]
pub struct TestFileListing {
    pub path: PathBuf,
    pub tests: Vec<(String, usize)>,
}

/// Contract for candidate-test discovery.
pub trait SourceScanner {
    fn scan(&self, root: &Path) -> Result<Vec<TestFileListing>>;
}

/// Walks the project tree for test files, skipping hidden and dependency
/// directories and anything matching an ignore pattern.
pub struct WalkdirScanner {
    pub ignore_patterns: Vec<String>,
}

const SKIP_DIRS: &[&str] = &[
    "target",
    "node_modules",
    "__pycache__",
    "venv",
    ".venv",
    "site-packages",
];

impl WalkdirScanner {
    pub fn new(ignore_patterns: Vec<String>) -> Self {
        Self { ignore_patterns }
    }

    fn is_ignored(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        self.ignore_patterns
            .iter()
            .any(|pattern| glob_match(pattern, &text))
    }
}

impl SourceScanner for WalkdirScanner {
    fn scan(&self, root: &Path) -> Result<Vec<TestFileListing>> {
        let mut listings = Vec::new();
        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                !name.starts_with('.') && !SKIP_DIRS.contains(&name.as_ref())
            })
        {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            if path.extension().is_none_or(|ext| ext != "py") {
                continue;
            }
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            if !(stem.starts_with("test") || stem.ends_with("test")) {
                continue;
            }
            if self.is_ignored(path) {
                continue;
            }
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read test file {}", path.display()))?;
            let tests = list_test_definitions(&content);
            if !tests.is_empty() {
                listings.push(TestFileListing {
                    path: path.to_path_buf(),
                    tests,
                });
            }
        }
        Ok(listings)
    }
}

/// (test name, 1-based definition line) for every `def test*` in a file.
pub fn list_test_definitions(content: &str) -> Vec<(String, usize)> {
    let mut out = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let cleaned = strip_trailing_comment(line);
        let cleaned = cleaned.trim();
        if cleaned.starts_with("def test") && cleaned.ends_with(':') {
            let name = cleaned
                .trim_start_matches("def ")
                .split('(')
                .next()
                .unwrap_or("")
                .trim()
                .to_string();
            out.push((name, index + 1));
        }
    }
    out
}

/// Build a [`TestMethod`] from a file's content and a definition line.
pub fn extract_test_method(
    content: &str,
    file_path: &Path,
    definition_line: usize,
    origin: TestOrigin,
    is_original: bool,
) -> Option<TestMethod> {
    let lines: Vec<&str> = content.lines().collect();
    let def_index = definition_line.checked_sub(1)?;
    let def_line = lines.get(def_index)?;
    let name = strip_trailing_comment(def_line)
        .trim()
        .strip_prefix("def ")?
        .split('(')
        .next()?
        .trim()
        .to_string();
    let def_indent = leading_whitespace_len(def_line);

    // The body runs until the first nonblank line at or left of the def's
    // indentation.
    let mut end = lines.len();
    for (offset, line) in lines[def_index + 1..].iter().enumerate() {
        if !line.trim().is_empty() && leading_whitespace_len(line) <= def_indent {
            end = def_index + 1 + offset;
            break;
        }
    }
    let mut body_lines: Vec<String> = lines[def_index..end].iter().map(|l| l.to_string()).collect();
    while body_lines.last().is_some_and(|l| l.trim().is_empty()) {
        body_lines.pop();
    }

    let class_name = lines[..def_index]
        .iter()
        .rev()
        .find_map(|line| {
            if leading_whitespace_len(line) < def_indent && !line.trim().is_empty() {
                line.trim().strip_prefix("class ").map(|rest| {
                    rest.split(['(', ':']).next().unwrap_or("").trim().to_string()
                })
            } else {
                None
            }
        })
        .unwrap_or_default();

    let import_lines = module_level_imports(content);
    let module = file_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    Some(TestMethod {
        origin,
        file_path: file_path.to_path_buf(),
        module,
        class_name,
        name,
        definition_line,
        body_lines,
        import_lines,
        is_original,
    })
}

/// Column-zero `import`/`from ... import ...` lines of a file.
pub fn module_level_imports(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|line| {
            !line.starts_with([' ', '\t'])
                && (line.starts_with("import ")
                    || (line.starts_with("from ") && line.contains(" import ")))
        })
        .map(|line| strip_trailing_comment(line).trim_end().to_string())
        .collect()
}

/// Every module (file stem) of a Python file under the root. Used to decide
/// which trace frames belong to the user's own code.
pub fn project_modules(root: &Path) -> Result<BTreeSet<String>> {
    let mut modules = BTreeSet::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !name.starts_with('.') && !SKIP_DIRS.contains(&name.as_ref())
        })
    {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().is_some_and(|ext| ext == "py") {
            if let Some(stem) = path.file_stem() {
                modules.insert(stem.to_string_lossy().to_string());
            }
        }
    }
    Ok(modules)
}

/// Cut a trailing `#` comment, respecting string quotes.
fn strip_trailing_comment(line: &str) -> &str {
    let mut in_single = false;
    let mut in_double = false;
    for (i, ch) in line.char_indices() {
        match ch {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '#' if !in_single && !in_double => return &line[..i],
            _ => {}
        }
    }
    line
}
