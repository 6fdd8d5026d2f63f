//! Literal fuzzing: target selection, value mutation, variant assembly.

mod targets;
mod values;
mod variants;

pub use targets::{select_targets, FuzzTarget};
pub use values::{candidate_values, fuzz_space_size, infer_character_palette, MutationKnobs};
pub use variants::{
    allocate_counts, assemble_choices, build_suite, dedup_rendered, render_variant,
    MutationCandidate, RenderedVariant,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FuzzError {
    /// The test contains no mutable literal, or every literal feeds an
    /// oracle. Fuzzing this test is aborted; other tests continue.
    #[error("no eligible fuzz targets in test '{0}'")]
    NoFuzzTargets(String),
}
