//! Causal-testing orchestration.
//!
//! Classify the failing test's literals, mutate the free ones, do the same
//! for call-similar existing tests, run the variant suite sequentially under
//! a wall-clock budget, reconstruct every trace, and report the passing and
//! failing variants closest to the original execution.

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::fingerprint::CallFingerprint;
use crate::fuzz::{
    allocate_counts, assemble_choices, build_suite, candidate_values, dedup_rendered,
    render_variant, select_targets, FuzzError, MutationCandidate, RenderedVariant,
};
use crate::oracle::{classify, AutoGuess, Interactive, Memoized, TieBreakResolver};
use crate::project::{project_modules, TestMethod, TestOrigin};
use crate::report::{render_report, ReportEntry};
use crate::runner::{run_until_deadline, ExecutionEnvironment, TestIdentity};
use crate::syntax::{parse_test_source, SyntaxTree};
use crate::trace::{
    add_exit_lines, crop_after_exit, crop_before_entry, ReconstructionContext, SourceCache,
    TraceError,
};

/// File (and module) the generated variants are written to.
pub const SUITE_MODULE: &str = "culprit_fuzzed_suite";
const SUITE_CLASS: &str = "TestFuzzed";
const VARIANT_PREFIX: &str = "test_fuzzed";

/// One executed variant after trace reconstruction.
#[derive(Debug, Clone)]
pub struct VariantOutcome {
    pub name: String,
    pub body: String,
    pub from_original: bool,
    pub passed: bool,
    pub trace: String,
}

/// Summary of one causal-testing run.
#[derive(Debug)]
pub struct CausalOutcome {
    pub report: String,
    pub failing_selected: Vec<String>,
    pub passing_selected: Vec<String>,
    pub variants_generated: usize,
    pub variants_executed: usize,
}

/// Run the whole pipeline for one failing test.
///
/// `original_raw_trace` is the raw trace captured when the original test was
/// run. `found_tests` is the unfiltered candidate pool from discovery; the
/// call-similarity cut happens here. The suite file is written into
/// `suite_dir` (the original test's directory, so its imports resolve) and
/// removed afterwards.
pub async fn run_causal_testing<E: ExecutionEnvironment>(
    config: &Config,
    env: &mut E,
    original: &TestMethod,
    original_raw_trace: &str,
    found_tests: Vec<TestMethod>,
    project_root: &Path,
    suite_dir: &Path,
) -> Result<CausalOutcome> {
    tracing::info!(
        "{} BEGIN CAUSAL TESTING FOR {} {}",
        "*".repeat(16),
        original.qualified_id(),
        "*".repeat(16)
    );

    let inner: Box<dyn TieBreakResolver> = if config.oracle.auto_guess {
        Box::new(AutoGuess)
    } else {
        Box::new(Interactive)
    };
    let mut resolver = Memoized::new(inner);

    let original_source = original.dedented_source();
    let original_tree = parse_test_source(&original_source)
        .with_context(|| format!("Failed to parse test {}", original.qualified_id()))?;

    // Cut the found pool down to call-similar tests.
    let original_fingerprint = CallFingerprint::of(&original_tree);
    tracing::debug!(
        "original test invokes {} call(s): {:?}",
        original_fingerprint.names().len(),
        original_fingerprint.names()
    );
    let mut inputs: Vec<(TestMethod, SyntaxTree)> = vec![(original.clone(), original_tree)];
    for test in found_tests {
        if test.origin == TestOrigin::Fuzzed {
            continue;
        }
        if test.file_path == original.file_path && test.name == original.name {
            continue;
        }
        let tree = match parse_test_source(&test.dedented_source()) {
            Ok(tree) => tree,
            Err(error) => {
                tracing::warn!("skipping unparsable test {}: {:#}", test.qualified_id(), error);
                continue;
            }
        };
        if CallFingerprint::of(&tree).matches(&original_fingerprint) {
            inputs.push((test, tree));
        }
    }
    tracing::info!(
        "{} call-similar test(s) will be fuzzed alongside the original",
        inputs.len() - 1
    );

    // Generate variants per allocated share.
    let knobs = config.mutation_knobs();
    let counts = allocate_counts(config.fuzzing.variants_total, inputs.len(), 0);
    let mut rng = StdRng::seed_from_u64(config.fuzzing.seed);
    let mut rendered: Vec<RenderedVariant> = Vec::new();
    let mut import_lines: Vec<String> = Vec::new();
    let mut counter = 0usize;

    for ((test, tree), requested) in inputs.iter().zip(&counts) {
        if *requested == 0 {
            continue;
        }
        let analysis = classify(tree, &test.name, &mut resolver);
        let targets = select_targets(tree, &analysis);
        if targets.is_empty() {
            tracing::warn!(
                "{}",
                FuzzError::NoFuzzTargets(test.qualified_id()).to_string()
            );
            continue;
        }
        let candidates: Vec<MutationCandidate> = targets
            .into_iter()
            .map(|target| MutationCandidate {
                candidates: candidate_values(&target.value, &knobs, &mut rng, None),
                target,
            })
            .collect();
        let choices = match assemble_choices(
            &candidates,
            test.is_original,
            *requested,
            &test.name,
            &mut rng,
        ) {
            Ok(choices) => choices,
            Err(error) => {
                tracing::warn!("{}", error);
                continue;
            }
        };
        let suffix = if test.is_original {
            "from_original"
        } else {
            "from_found"
        };
        for choice in choices {
            let name = format!("{}_{}_{}", VARIANT_PREFIX, counter, suffix);
            counter += 1;
            let body = render_variant(tree, &candidates, &choice, &name);
            rendered.push(RenderedVariant {
                name,
                body,
                from_original: test.is_original,
            });
        }
        for import in &test.import_lines {
            import_lines.push(import.clone());
        }
    }

    let variants = dedup_rendered(rendered);
    if variants.is_empty() {
        bail!(
            "no variant could be generated for {}; nothing to analyze",
            original.qualified_id()
        );
    }
    tracing::info!("generated {} distinct variant(s)", variants.len());

    // Write the suite and run it sequentially under the time budget.
    let suite_path = suite_dir.join(format!("{}.py", SUITE_MODULE));
    let suite = build_suite(&import_lines, &variants);
    std::fs::write(&suite_path, &suite)
        .with_context(|| format!("Failed to write variant suite to {}", suite_path.display()))?;

    let identities: Vec<TestIdentity> = variants
        .iter()
        .map(|v| TestIdentity {
            module: SUITE_MODULE.to_string(),
            class_name: SUITE_CLASS.to_string(),
            name: v.name.clone(),
        })
        .collect();
    let deadline = Instant::now() + Duration::from_secs(config.execution.time_budget_seconds);
    let records = run_until_deadline(env, &identities, deadline).await;
    let executed = records.len();

    // Reconstruct every trace, the original's included.
    let modules = project_modules(project_root)?;
    let interesting = |module: &str| {
        modules.contains(module)
            && !config
                .ignore_patterns
                .iter()
                .any(|pattern| glob_match::glob_match(pattern, &format!("{}.py", module)))
    };
    let mut cache = SourceCache::new(vec![suite_dir.to_path_buf(), project_root.to_path_buf()]);

    let original_trace = reconstruct_window(
        original_raw_trace,
        &original.module,
        &original.name,
        &mut cache,
        &interesting,
    )
    .with_context(|| {
        format!(
            "Failed to reconstruct the original trace of {}",
            original.qualified_id()
        )
    })?;

    let mut outcomes: Vec<VariantOutcome> = Vec::new();
    for (index, record) in records {
        let variant = &variants[index];
        match reconstruct_window(
            &record.raw_trace,
            SUITE_MODULE,
            &variant.name,
            &mut cache,
            &interesting,
        ) {
            Ok(trace) => outcomes.push(VariantOutcome {
                name: variant.name.clone(),
                body: variant.body.clone(),
                from_original: variant.from_original,
                passed: record.passed,
                trace,
            }),
            Err(error @ TraceError::StackDiscipline { .. }) => {
                // The trace format assumptions themselves are broken.
                let _ = std::fs::remove_file(&suite_path);
                return Err(error).context("trace reconstruction failed");
            }
            Err(error) => {
                tracing::warn!("variant {} trace unusable: {}", variant.name, error);
            }
        }
    }

    let _ = std::fs::remove_file(&suite_path);

    let from_original = outcomes.iter().filter(|o| o.from_original).count();
    tracing::debug!(
        "{} of {} usable variant(s) derive from the original test",
        from_original,
        outcomes.len()
    );

    // Keep the three most similar traces on each side of the verdict.
    let (failing, passing) = crate::trace::distance::select_closest(
        &outcomes,
        &original_trace,
        3,
        |o: &VariantOutcome| o.trace.as_str(),
        |o: &VariantOutcome| !o.passed,
    );

    let passing_entries: Vec<ReportEntry<'_>> = passing.iter().map(|o| entry(o)).collect();
    let failing_entries: Vec<ReportEntry<'_>> = failing.iter().map(|o| entry(o)).collect();
    let report = render_report(
        &passing_entries,
        &failing_entries,
        &original_source,
        &original_trace,
    );
    tracing::info!(
        "{} END CAUSAL TESTING FOR {} {}",
        "*".repeat(16),
        original.qualified_id(),
        "*".repeat(16)
    );

    Ok(CausalOutcome {
        report,
        failing_selected: failing.iter().map(|o| o.name.clone()).collect(),
        passing_selected: passing.iter().map(|o| o.name.clone()).collect(),
        variants_generated: variants.len(),
        variants_executed: executed,
    })
}

fn entry(outcome: &VariantOutcome) -> ReportEntry<'_> {
    ReportEntry {
        name: &outcome.name,
        passed: outcome.passed,
        body: &outcome.body,
        trace: &outcome.trace,
    }
}

/// Crop a raw trace to one function's runtime and insert exit markers:
/// everything before the first entry and after the last exit goes away.
fn reconstruct_window(
    raw: &str,
    module: &str,
    func: &str,
    cache: &mut SourceCache,
    interesting: &dyn Fn(&str) -> bool,
) -> Result<String, TraceError> {
    let cropped = crop_before_entry(raw, module, func)?;
    let mut ctx = ReconstructionContext::new(cache, |m| interesting(m));
    let rebuilt = add_exit_lines(&cropped, &mut ctx)?;
    tracing::debug!(
        "{}.{}: {} line(s) under non-ignored code, {} module(s) observed",
        module,
        func,
        rebuilt.interesting_indices.len(),
        rebuilt.modules_seen.len()
    );
    crop_after_exit(&rebuilt.text, module, func)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{extract_test_method, TestOrigin};
    use crate::runner::ExecutionRecord;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const WIDGETS: &str = "\
class Widget:
    def __init__(self, n):
        self.n = n

    def spin(self):
        return self.n * self.n
";

    const TEST_FILE: &str = "\
import unittest
from widgets import Widget


class TestWidget(unittest.TestCase):
    def test_spin(self):
        w = Widget(3)
        self.assertEqual(9, w.spin())

    def test_twirl(self):
        w = Widget(4)
        self.assertEqual(16, w.spin())
";

    /// Synthesizes plausible traces for whatever variant it is asked to run:
    /// an entry marker, one body line inside the variant (located by reading
    /// the generated suite), and a foreign tail line that forces the exit.
    struct FakeEnv {
        suite_path: PathBuf,
        runs: usize,
    }

    impl ExecutionEnvironment for FakeEnv {
        async fn run_test(&mut self, test: &TestIdentity) -> Result<ExecutionRecord> {
            self.runs += 1;
            let suite = std::fs::read_to_string(&self.suite_path)?;
            let def_line = suite
                .lines()
                .position(|l| l.contains(&format!("def {}(", test.name)))
                .map(|i| i + 1)
                .expect("variant must exist in suite");
            let raw_trace = format!(
                " --- modulename: {m}, funcname: {f}\n{m}.py({l}): body\ntail.py(9): done\n",
                m = test.module,
                f = test.name,
                l = def_line + 1,
            );
            Ok(ExecutionRecord {
                passed: self.runs % 2 == 0,
                raw_trace,
                traceback: None,
                execution_error: false,
            })
        }
    }

    fn write_project(dir: &TempDir) {
        std::fs::write(dir.path().join("widgets.py"), WIDGETS).unwrap();
        std::fs::write(dir.path().join("test_widgets.py"), TEST_FILE).unwrap();
    }

    fn original_method(dir: &TempDir) -> TestMethod {
        extract_test_method(
            TEST_FILE,
            &dir.path().join("test_widgets.py"),
            6,
            TestOrigin::Found,
            true,
        )
        .unwrap()
    }

    fn found_method(dir: &TempDir) -> TestMethod {
        extract_test_method(
            TEST_FILE,
            &dir.path().join("test_widgets.py"),
            10,
            TestOrigin::Found,
            false,
        )
        .unwrap()
    }

    fn original_raw_trace() -> String {
        // Entry into the original test, one body line (line 7 sits inside
        // test_spin in TEST_FILE), and a foreign tail to force the exit.
        " --- modulename: test_widgets, funcname: test_spin\ntest_widgets.py(7): w = Widget(3)\ntail.py(9): done\n".to_string()
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.oracle.auto_guess = true;
        config.fuzzing.variants_total = 12;
        config.fuzzing.mutants_per_target = 6;
        config
    }

    #[tokio::test]
    async fn test_end_to_end_pipeline() {
        colored::control::set_override(false);
        let dir = TempDir::new().unwrap();
        write_project(&dir);
        let original = original_method(&dir);
        let found = vec![found_method(&dir)];
        let mut env = FakeEnv {
            suite_path: dir.path().join(format!("{}.py", SUITE_MODULE)),
            runs: 0,
        };

        let outcome = run_causal_testing(
            &test_config(),
            &mut env,
            &original,
            &original_raw_trace(),
            found,
            dir.path(),
            dir.path(),
        )
        .await
        .unwrap();

        assert!(outcome.variants_generated > 0);
        assert_eq!(outcome.variants_executed, env.runs);
        // At most three selected per side, and every selected variant exists.
        assert!(outcome.failing_selected.len() <= 3);
        assert!(outcome.passing_selected.len() <= 3);
        assert!(!outcome.report.is_empty());
        // The suite file is cleaned up afterwards.
        assert!(!env.suite_path.exists());
    }

    #[tokio::test]
    async fn test_found_test_contributes_variants() {
        colored::control::set_override(false);
        let dir = TempDir::new().unwrap();
        write_project(&dir);
        let original = original_method(&dir);
        let found = vec![found_method(&dir)];
        let mut env = FakeEnv {
            suite_path: dir.path().join(format!("{}.py", SUITE_MODULE)),
            runs: 0,
        };

        let outcome = run_causal_testing(
            &test_config(),
            &mut env,
            &original,
            &original_raw_trace(),
            found,
            dir.path(),
            dir.path(),
        )
        .await
        .unwrap();

        // test_twirl is call-similar to test_spin (same call sequence), so
        // some variants should be derived from it.
        let all: Vec<String> = outcome
            .failing_selected
            .iter()
            .chain(outcome.passing_selected.iter())
            .cloned()
            .collect();
        assert!(all.iter().all(|n| n.starts_with("test_fuzzed_")));
        assert!(outcome.variants_generated >= 6);
    }

    #[tokio::test]
    async fn test_unparsable_found_test_is_skipped() {
        colored::control::set_override(false);
        let dir = TempDir::new().unwrap();
        write_project(&dir);
        let original = original_method(&dir);
        let mut broken = found_method(&dir);
        broken.name = "test_broken".to_string();
        broken.body_lines = vec!["def test_broken(self:".to_string()];
        let mut env = FakeEnv {
            suite_path: dir.path().join(format!("{}.py", SUITE_MODULE)),
            runs: 0,
        };

        let outcome = run_causal_testing(
            &test_config(),
            &mut env,
            &original,
            &original_raw_trace(),
            vec![broken],
            dir.path(),
            dir.path(),
        )
        .await
        .unwrap();
        assert!(outcome.variants_generated > 0);
    }

    #[tokio::test]
    async fn test_original_without_literals_fails_cleanly() {
        colored::control::set_override(false);
        let dir = TempDir::new().unwrap();
        // A test whose only literal is the oracle: no fuzz targets at all.
        let content = "\
import unittest


class TestNothing(unittest.TestCase):
    def test_fixed(self):
        self.assertEqual(9, spin())
";
        std::fs::write(dir.path().join("test_nothing.py"), content).unwrap();
        let original = extract_test_method(
            content,
            &dir.path().join("test_nothing.py"),
            5,
            TestOrigin::Found,
            true,
        )
        .unwrap();
        let mut env = FakeEnv {
            suite_path: dir.path().join(format!("{}.py", SUITE_MODULE)),
            runs: 0,
        };

        let result = run_causal_testing(
            &test_config(),
            &mut env,
            &original,
            " --- modulename: test_nothing, funcname: test_fixed\n",
            Vec::new(),
            dir.path(),
            dir.path(),
        )
        .await;
        assert!(result.is_err());
    }
}
