mod causal;
mod config;
mod fingerprint;
mod fuzz;
mod oracle;
mod project;
mod report;
mod runner;
mod syntax;
mod trace;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::config::Config;
use crate::project::{
    extract_test_method, list_test_definitions, SourceScanner, TestMethod, TestOrigin,
    WalkdirScanner,
};
use crate::runner::{ExecutionEnvironment, PythonRunner, TestIdentity};
use crate::trace::TraceError;

#[derive(Parser)]
#[command(name = "culprit")]
#[command(version)]
#[command(about = "Causal fault localization for unit tests")]
struct Cli {
    /// Path to the test file to analyze
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Definition line numbers of the tests to analyze (first line is 1),
    /// or "all" for every failing test in the file
    #[arg(short, long, default_value = "all", num_args = 1..)]
    lines: Vec<String>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Analyze tests even when they pass
    #[arg(short = 'p', long)]
    include_passing: bool,

    /// Answer oracle tie-break questions with "yes" instead of prompting
    #[arg(long)]
    auto_guess: bool,

    /// Override the mutation seed from the configuration
    #[arg(long)]
    seed: Option<u64>,

    /// Write a default configuration file and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.init_config {
        let config = Config::default();
        config.save(cli.config.as_deref())?;
        let path = cli
            .config
            .clone()
            .or_else(Config::default_config_path)
            .context("No config path available")?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let mut config = Config::load(cli.config.as_deref())?;
    if cli.auto_guess {
        config.oracle.auto_guess = true;
    }
    if let Some(seed) = cli.seed {
        config.fuzzing.seed = seed;
    }

    let level = config
        .general
        .log_level
        .parse::<Level>()
        .unwrap_or(Level::INFO);
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .init();

    let file = cli.file.context("--file is required")?;
    let file = file
        .canonicalize()
        .with_context(|| format!("Test file not found: {}", file.display()))?;
    let project_root = file
        .parent()
        .context("Test file has no parent directory")?
        .to_path_buf();
    let content = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let definitions = list_test_definitions(&content);
    if definitions.is_empty() {
        bail!("no test methods found in {}", file.display());
    }
    let selected = selected_definition_lines(&cli.lines, &definitions)?;

    // Discover the candidate pool once; the call-similarity cut happens per
    // original test.
    let scanner = WalkdirScanner::new(config.ignore_patterns.clone());
    let mut found_tests: Vec<TestMethod> = Vec::new();
    for listing in scanner.scan(&project_root)? {
        let listing_content = std::fs::read_to_string(&listing.path)
            .with_context(|| format!("Failed to read {}", listing.path.display()))?;
        for (_, line) in &listing.tests {
            if let Some(method) = extract_test_method(
                &listing_content,
                &listing.path,
                *line,
                TestOrigin::Found,
                false,
            ) {
                found_tests.push(method);
            }
        }
    }
    tracing::info!("{} candidate test(s) discovered", found_tests.len());

    let mut runner = PythonRunner::new(
        config.execution.python.clone(),
        Duration::from_secs(config.execution.variant_timeout_seconds),
        &project_root,
    )?;

    let mut analyzed = 0usize;
    for line in selected {
        let Some(original) =
            extract_test_method(&content, &file, line, TestOrigin::Found, true)
        else {
            tracing::warn!("line {} is not a test definition; skipped", line);
            continue;
        };

        let identity = TestIdentity {
            module: original.module.clone(),
            class_name: original.class_name.clone(),
            name: original.name.clone(),
        };
        let record = runner.run_test(&identity).await?;
        if record.execution_error {
            tracing::warn!(
                "{} errored rather than failing an assertion; skipped",
                original.qualified_id()
            );
            continue;
        }
        if record.passed && !cli.include_passing {
            tracing::info!("{} passes; skipped", original.qualified_id());
            continue;
        }
        if let Some(traceback) = &record.traceback {
            tracing::debug!("original failure traceback:\n{}", traceback);
        }

        let result = causal::run_causal_testing(
            &config,
            &mut runner,
            &original,
            &record.raw_trace,
            found_tests.clone(),
            &project_root,
            &project_root,
        )
        .await;
        match result {
            Ok(outcome) => {
                analyzed += 1;
                print!("{}", outcome.report);
                tracing::info!(
                    "{}: {} variant(s) generated, {} executed, {} failing / {} passing shown",
                    original.qualified_id(),
                    outcome.variants_generated,
                    outcome.variants_executed,
                    outcome.failing_selected.len(),
                    outcome.passing_selected.len()
                );
            }
            Err(error) => {
                // Broken trace structure means every further reconstruction
                // would rest on the same bad assumptions.
                if error.downcast_ref::<TraceError>().is_some() {
                    runner.cleanup();
                    return Err(error);
                }
                tracing::error!("{}: {:#}", original.qualified_id(), error);
            }
        }
    }

    runner.cleanup();
    if analyzed == 0 {
        tracing::info!("nothing to analyze; use --include-passing to fuzz passing tests");
    }
    Ok(())
}

/// Resolve the `--lines` argument against the file's test definitions.
fn selected_definition_lines(
    lines: &[String],
    definitions: &[(String, usize)],
) -> Result<Vec<usize>> {
    if lines.len() == 1 && lines[0] == "all" {
        return Ok(definitions.iter().map(|(_, line)| *line).collect());
    }
    let mut selected = Vec::new();
    for raw in lines {
        let line: usize = raw
            .parse()
            .with_context(|| format!("--lines takes numbers or \"all\", got '{}'", raw))?;
        if definitions.iter().any(|(_, l)| *l == line) {
            selected.push(line);
        } else {
            tracing::warn!("no test definition starts on line {}", line);
        }
    }
    Ok(selected)
}
