use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::fuzz::MutationKnobs;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Mutation generation knobs
    #[serde(default)]
    pub fuzzing: FuzzingConfig,

    /// Variant execution settings
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Oracle classification settings
    #[serde(default)]
    pub oracle: OracleConfig,

    /// Glob patterns for files whose failures should not be analyzed
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzingConfig {
    /// Total number of variants to generate across all input tests
    #[serde(default = "default_variants_total")]
    pub variants_total: usize,

    /// Candidate list length per literal (the original value included)
    #[serde(default = "default_mutants_per_target")]
    pub mutants_per_target: usize,

    /// Maximum magnitude added to a number, scaled by its nearest decade
    #[serde(default = "default_max_added_magnitude")]
    pub max_added_magnitude: i64,

    /// Probability that a mutated number is negated
    #[serde(default = "default_negate_probability")]
    pub negate_probability: f64,

    /// Maximum character edits applied to a string
    #[serde(default = "default_max_string_edits")]
    pub max_string_edits: usize,

    /// Maximum angle perturbation (radians) for complex values
    #[serde(default = "default_max_angle_delta")]
    pub max_angle_delta: f64,

    /// Probability that a bool flips
    #[serde(default = "default_bool_flip_probability")]
    pub bool_flip_probability: f64,

    /// Seed for the mutation generator; fixed seed, fixed variants
    #[serde(default = "default_seed")]
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Python executable used to run tests
    #[serde(default = "default_python")]
    pub python: String,

    /// Wall-clock budget for running variants, in seconds. Checked before
    /// each launch; once exceeded no new variant is started.
    #[serde(default = "default_time_budget")]
    pub time_budget_seconds: u64,

    /// Per-variant timeout in seconds
    #[serde(default = "default_variant_timeout")]
    pub variant_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Answer ambiguous-argument questions with "yes" instead of prompting
    #[serde(default)]
    pub auto_guess: bool,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_variants_total() -> usize {
    50
}

fn default_mutants_per_target() -> usize {
    51
}

fn default_max_added_magnitude() -> i64 {
    2
}

fn default_negate_probability() -> f64 {
    0.25
}

fn default_max_string_edits() -> usize {
    3
}

fn default_max_angle_delta() -> f64 {
    std::f64::consts::PI / 16.0
}

fn default_bool_flip_probability() -> f64 {
    0.5
}

fn default_seed() -> u64 {
    0
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_time_budget() -> u64 {
    60
}

fn default_variant_timeout() -> u64 {
    30
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for FuzzingConfig {
    fn default() -> Self {
        Self {
            variants_total: default_variants_total(),
            mutants_per_target: default_mutants_per_target(),
            max_added_magnitude: default_max_added_magnitude(),
            negate_probability: default_negate_probability(),
            max_string_edits: default_max_string_edits(),
            max_angle_delta: default_max_angle_delta(),
            bool_flip_probability: default_bool_flip_probability(),
            seed: default_seed(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            python: default_python(),
            time_budget_seconds: default_time_budget(),
            variant_timeout_seconds: default_variant_timeout(),
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self { auto_guess: false }
    }
}

impl Config {
    /// Load configuration from file, or create default if not found
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(Self::default_config_path);

        let config = if let Some(ref path) = config_path {
            if path.exists() {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config from {:?}", path))?;
                toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config from {:?}", path))?
            } else {
                Config::default()
            }
        } else {
            Config::default()
        };

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = path
            .map(PathBuf::from)
            .or_else(Self::default_config_path)
            .context("No config path available")?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config to {:?}", config_path))?;

        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "culprit", "culprit")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// The mutation knobs expressed by this configuration.
    pub fn mutation_knobs(&self) -> MutationKnobs {
        MutationKnobs {
            mutants_per_target: self.fuzzing.mutants_per_target,
            max_added_magnitude: self.fuzzing.max_added_magnitude,
            negate_probability: self.fuzzing.negate_probability,
            max_string_edits: self.fuzzing.max_string_edits,
            max_angle_delta: self.fuzzing.max_angle_delta,
            bool_flip_probability: self.fuzzing.bool_flip_probability,
        }
    }
}
