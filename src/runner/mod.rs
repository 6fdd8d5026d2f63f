//! Variant execution against a live Python interpreter.
//!
//! The engine only depends on the [`ExecutionEnvironment`] contract: hand in
//! a fully qualified test identity, get back pass/fail, the raw line trace,
//! and a traceback when something broke. [`PythonRunner`] implements it by
//! running one test through `python -m trace --trace` and collecting the
//! verdict through a JSON side channel, since the trace output owns stdout.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Fully qualified identity of one runnable test.
#[derive(Debug, Clone)]
pub struct TestIdentity {
    /// Module (file stem) containing the test. The module must be importable
    /// from the runner's working directory.
    pub module: String,
    /// Enclosing unittest class, empty for module-level functions.
    pub class_name: String,
    pub name: String,
}

/// Outcome of one test execution.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    /// True when every assertion passed.
    pub passed: bool,
    /// Raw line-by-line trace captured from the interpreter.
    pub raw_trace: String,
    /// Failure or error traceback, when there was one.
    pub traceback: Option<String>,
    /// True when the run died on an error (or timeout) rather than a plain
    /// assertion failure. Such variants are excluded from ranking.
    pub execution_error: bool,
}

/// Contract for the collaborator that actually runs tests.
pub trait ExecutionEnvironment {
    fn run_test(
        &mut self,
        test: &TestIdentity,
    ) -> impl std::future::Future<Output = Result<ExecutionRecord>>;
}

const DRIVER_FILE: &str = "_culprit_driver.py";
const VERDICT_FILE: &str = "_culprit_verdict.json";

const DRIVER_SOURCE: &str = r#"import importlib
import json
import os
import sys
import unittest

module_name, class_name, test_name, verdict_path = sys.argv[1:5]
sys.path.insert(0, os.path.dirname(os.path.abspath(__file__)))
module = importlib.import_module(module_name)
if class_name:
    case = getattr(module, class_name)(test_name)
else:
    case = unittest.FunctionTestCase(getattr(module, test_name))
suite = unittest.TestSuite([case])
with open(os.devnull, "w") as sink:
    runner = unittest.TextTestRunner(stream=sink, verbosity=0)
    result = runner.run(suite)
problems = result.failures + result.errors
verdict = {
    "failures": len(result.failures),
    "errors": len(result.errors),
    "traceback": problems[0][1] if problems else None,
}
with open(verdict_path, "w", encoding="utf-8") as handle:
    json.dump(verdict, handle)
"#;

#[derive(Debug, Deserialize)]
struct Verdict {
    failures: usize,
    errors: usize,
    traceback: Option<String>,
}

/// Runs tests one at a time under the stdlib line tracer.
pub struct PythonRunner {
    python: String,
    timeout: Duration,
    work_dir: PathBuf,
}

impl PythonRunner {
    /// `work_dir` is where the test modules live; the driver script is
    /// written next to them so imports resolve.
    pub fn new(python: impl Into<String>, timeout: Duration, work_dir: &Path) -> Result<Self> {
        let driver_path = work_dir.join(DRIVER_FILE);
        std::fs::write(&driver_path, DRIVER_SOURCE)
            .with_context(|| format!("Failed to write driver to {}", driver_path.display()))?;
        Ok(Self {
            python: python.into(),
            timeout,
            work_dir: work_dir.to_path_buf(),
        })
    }

    /// Remove the driver script written at construction.
    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(self.work_dir.join(DRIVER_FILE));
    }
}

impl ExecutionEnvironment for PythonRunner {
    async fn run_test(&mut self, test: &TestIdentity) -> Result<ExecutionRecord> {
        let verdict_path = self.work_dir.join(VERDICT_FILE);
        let _ = std::fs::remove_file(&verdict_path);

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.python)
                .arg("-m")
                .arg("trace")
                .arg("--trace")
                .arg(DRIVER_FILE)
                .arg(&test.module)
                .arg(&test.class_name)
                .arg(&test.name)
                .arg(VERDICT_FILE)
                .current_dir(&self.work_dir)
                .output(),
        )
        .await;

        let output = match output {
            Ok(spawned) => spawned.context("Failed to run python")?,
            Err(_) => {
                tracing::warn!(
                    "test {} timed out after {:?}",
                    test.name,
                    self.timeout
                );
                return Ok(ExecutionRecord {
                    passed: false,
                    raw_trace: String::new(),
                    traceback: None,
                    execution_error: true,
                });
            }
        };

        let raw_trace = String::from_utf8_lossy(&output.stdout).to_string();
        let verdict = std::fs::read_to_string(&verdict_path)
            .ok()
            .and_then(|text| serde_json::from_str::<Verdict>(&text).ok());
        let _ = std::fs::remove_file(&verdict_path);

        match verdict {
            Some(verdict) => Ok(ExecutionRecord {
                passed: verdict.failures == 0 && verdict.errors == 0,
                execution_error: verdict.errors > 0,
                traceback: verdict.traceback,
                raw_trace,
            }),
            None => {
                // The driver never reached its verdict write: import error,
                // syntax error in a variant, interpreter missing.
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                tracing::warn!("test {} produced no verdict: {}", test.name, stderr);
                Ok(ExecutionRecord {
                    passed: false,
                    raw_trace,
                    traceback: Some(stderr),
                    execution_error: true,
                })
            }
        }
    }
}

/// Run tests strictly sequentially until the deadline. The deadline is
/// checked before each launch; a variant already started is allowed to
/// finish. Variants that error out (rather than failing an assertion) are
/// logged and dropped. Returns (input index, record) pairs.
pub async fn run_until_deadline<E: ExecutionEnvironment>(
    env: &mut E,
    tests: &[TestIdentity],
    deadline: Instant,
) -> Vec<(usize, ExecutionRecord)> {
    let mut records = Vec::new();
    for (index, test) in tests.iter().enumerate() {
        if Instant::now() >= deadline {
            tracing::info!(
                "time budget exhausted after {} of {} variants; returning partial results",
                index,
                tests.len()
            );
            break;
        }
        match env.run_test(test).await {
            Ok(record) if record.execution_error => {
                tracing::warn!("variant {} errored during execution; excluded", test.name);
            }
            Ok(record) => records.push((index, record)),
            Err(error) => {
                tracing::warn!("variant {} could not be run: {:#}", test.name, error);
            }
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Scripted {
        outcomes: Vec<ExecutionRecord>,
        cursor: usize,
        ran: usize,
    }

    impl Scripted {
        fn new(outcomes: Vec<ExecutionRecord>) -> Self {
            Self {
                outcomes,
                cursor: 0,
                ran: 0,
            }
        }
    }

    impl ExecutionEnvironment for Scripted {
        async fn run_test(&mut self, _test: &TestIdentity) -> Result<ExecutionRecord> {
            self.ran += 1;
            let record = self.outcomes[self.cursor % self.outcomes.len()].clone();
            self.cursor += 1;
            Ok(record)
        }
    }

    fn record(passed: bool, execution_error: bool) -> ExecutionRecord {
        ExecutionRecord {
            passed,
            raw_trace: "trace".to_string(),
            traceback: None,
            execution_error,
        }
    }

    fn identity(name: &str) -> TestIdentity {
        TestIdentity {
            module: "suite".to_string(),
            class_name: "TestFuzzed".to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_run_all_within_budget() {
        let mut env = Scripted::new(vec![record(true, false)]);
        let tests = vec![identity("a"), identity("b"), identity("c")];
        let deadline = Instant::now() + Duration::from_secs(60);
        let records = run_until_deadline(&mut env, &tests, deadline).await;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].0, 0);
        assert_eq!(records[2].0, 2);
    }

    #[tokio::test]
    async fn test_expired_deadline_runs_nothing() {
        let mut env = Scripted::new(vec![record(true, false)]);
        let tests = vec![identity("a"), identity("b")];
        let deadline = Instant::now() - Duration::from_secs(1);
        let records = run_until_deadline(&mut env, &tests, deadline).await;
        assert!(records.is_empty());
        assert_eq!(env.ran, 0);
    }

    #[tokio::test]
    async fn test_execution_errors_are_excluded() {
        let mut env = Scripted::new(vec![
            record(true, false),
            record(false, true),
            record(false, false),
        ]);
        let tests = vec![identity("a"), identity("b"), identity("c")];
        let deadline = Instant::now() + Duration::from_secs(60);
        let records = run_until_deadline(&mut env, &tests, deadline).await;
        let indices: Vec<usize> = records.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn test_runner_writes_driver() {
        let dir = TempDir::new().unwrap();
        let _runner =
            PythonRunner::new("python3", Duration::from_secs(5), dir.path()).unwrap();
        let driver = dir.path().join(DRIVER_FILE);
        let content = std::fs::read_to_string(driver).unwrap();
        assert!(content.contains("unittest.TextTestRunner"));
        assert!(content.contains("json.dump"));
    }

    #[test]
    fn test_verdict_parsing() {
        let verdict: Verdict =
            serde_json::from_str("{\"failures\": 1, \"errors\": 0, \"traceback\": \"boom\"}")
                .unwrap();
        assert_eq!(verdict.failures, 1);
        assert_eq!(verdict.errors, 0);
        assert_eq!(verdict.traceback.as_deref(), Some("boom"));
    }
}
