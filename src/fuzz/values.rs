//! Type-aware candidate value generation.
//!
//! Each literal type has its own mutation rule and its own bound on how many
//! distinct values the rule can reach (the fuzz space). The generation loop
//! stops at the requested mutant count or at that bound, whichever comes
//! first, so degenerate knob settings cannot loop forever.

use std::collections::{BTreeSet, HashSet};

use rand::rngs::StdRng;
use rand::Rng;

use crate::syntax::LiteralValue;

/// Knobs controlling how far mutated values may drift from the original.
#[derive(Debug, Clone)]
pub struct MutationKnobs {
    /// Candidate list length per target, original included.
    pub mutants_per_target: usize,
    /// Maximum magnitude added to a number, scaled by its nearest decade.
    pub max_added_magnitude: i64,
    /// Probability that a mutated int/float is negated.
    pub negate_probability: f64,
    /// Maximum number of character edits applied to a string.
    pub max_string_edits: usize,
    /// Maximum angle perturbation (radians) for complex values.
    pub max_angle_delta: f64,
    /// Probability that a bool flips.
    pub bool_flip_probability: f64,
}

impl Default for MutationKnobs {
    fn default() -> Self {
        Self {
            mutants_per_target: 51,
            max_added_magnitude: 2,
            negate_probability: 0.25,
            max_string_edits: 3,
            max_angle_delta: std::f64::consts::PI / 16.0,
            bool_flip_probability: 0.5,
        }
    }
}

/// Related character groups used to widen an inferred palette.
const CHARACTER_GROUPS: &[&str] = &[
    "abcdefghijklmnopqrstuvwxyz",
    "ABCDEFGHIJKLMNOPQRSTUVWXYZ",
    "0123456789",
    ".!?,",
    "+-/*",
    "()",
    "[]",
    "{}",
    "<>",
];

const LOWERCASE: &str = "abcdefghijklmnopqrstuvwxyz";

/// Infer the characters that may be inserted into or substituted within a
/// string: every character already present, widened by its group mates.
/// Sorted for deterministic draws under a fixed seed.
pub fn infer_character_palette(input: &str) -> Vec<char> {
    if input.is_empty() {
        tracing::warn!(
            "fuzzing an empty string; assuming lowercase alphabetical characters are okay to add"
        );
        return LOWERCASE.chars().collect();
    }
    let mut palette: BTreeSet<char> = BTreeSet::new();
    for ch in input.chars() {
        palette.insert(ch);
        for group in CHARACTER_GROUPS {
            if group.contains(ch) {
                palette.extend(group.chars());
            }
        }
    }
    palette.into_iter().collect()
}

/// Nearest decade exponent of a magnitude; zero maps to the unit decade.
fn nearest_decade(magnitude: f64) -> i32 {
    if magnitude == 0.0 {
        0
    } else {
        magnitude.abs().log10().round() as i32
    }
}

/// How many distinct values the mutation rule can produce for `value`,
/// the original included. Exact for bools and zero-radius numerics, a
/// conservative lower bound for ints and strings, infinite otherwise.
pub fn fuzz_space_size(
    value: &LiteralValue,
    knobs: &MutationKnobs,
    palette: Option<&[char]>,
) -> f64 {
    let a = knobs.max_added_magnitude;
    match value {
        LiteralValue::Int(v) => {
            let radius = (a as f64) * 10f64.powi(nearest_decade(v.abs() as f64));
            let mut size = 1.0 + 2.0 * radius;
            if knobs.negate_probability > 0.0 && knobs.negate_probability < 1.0 {
                size *= 2.0;
                let magnitude = v.abs() as f64;
                if radius >= magnitude {
                    // Negation of small values overlaps the additive range.
                    size -= 1.0 + 2.0 * (radius - magnitude);
                }
            }
            size.max(1.0)
        }
        LiteralValue::Float(_) => {
            if a == 0 {
                if knobs.negate_probability == 0.0 {
                    1.0
                } else {
                    2.0
                }
            } else {
                f64::INFINITY
            }
        }
        LiteralValue::Complex { .. } => {
            if a == 0 && knobs.max_angle_delta == 0.0 {
                1.0
            } else {
                f64::INFINITY
            }
        }
        LiteralValue::Str(s) => {
            let edits = knobs.max_string_edits as i32;
            if s.is_empty() {
                (LOWERCASE.len() as f64).powi(edits)
            } else {
                let chars = match palette {
                    Some(p) => p.len() as f64,
                    None => infer_character_palette(s).len() as f64,
                };
                let insertions = chars * knobs.max_string_edits as f64
                    + (knobs.max_string_edits.min(s.chars().count() + 1)) as f64;
                chars.powi(edits).max(insertions)
            }
        }
        LiteralValue::Bool(_) => {
            if knobs.bool_flip_probability == 0.0 {
                1.0
            } else {
                2.0
            }
        }
        LiteralValue::None => 1.0,
    }
}

/// Produce the candidate list for one literal. Element 0 is always the
/// original value; the rest are distinct mutations. The result never exceeds
/// `knobs.mutants_per_target` and never falls short of
/// `min(mutants_per_target, fuzz_space_size)`.
pub fn candidate_values(
    original: &LiteralValue,
    knobs: &MutationKnobs,
    rng: &mut StdRng,
    palette_override: Option<&[char]>,
) -> Vec<LiteralValue> {
    if knobs.mutants_per_target == 1 {
        tracing::warn!(
            "mutants_per_target is 1; the original value is candidate 0, so no mutation happens"
        );
    }
    let palette: Option<Vec<char>> = match original {
        LiteralValue::Str(s) => Some(match palette_override {
            Some(p) => p.to_vec(),
            None => infer_character_palette(s),
        }),
        _ => None,
    };
    let space = fuzz_space_size(original, knobs, palette.as_deref());

    let mut out = vec![original.clone()];
    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(dedup_key(original));

    while out.len() < knobs.mutants_per_target && (out.len() as f64) < space {
        let mutated = mutate_once(original, knobs, rng, palette.as_deref());
        if seen.insert(dedup_key(&mutated)) {
            out.push(mutated);
        }
    }
    out
}

fn dedup_key(value: &LiteralValue) -> String {
    match value {
        LiteralValue::Int(v) => format!("i{}", v),
        LiteralValue::Float(v) => format!("f{}", v.to_bits()),
        LiteralValue::Complex { re, im } => format!("c{}:{}", re.to_bits(), im.to_bits()),
        LiteralValue::Str(s) => format!("s{}", s),
        LiteralValue::Bool(b) => format!("b{}", b),
        LiteralValue::None => "n".to_string(),
    }
}

fn mutate_once(
    original: &LiteralValue,
    knobs: &MutationKnobs,
    rng: &mut StdRng,
    palette: Option<&[char]>,
) -> LiteralValue {
    let a = knobs.max_added_magnitude;
    match original {
        LiteralValue::Int(v) => {
            let radius = ((a as f64) * 10f64.powi(nearest_decade(v.abs() as f64)))
                .min(1e15) as i64;
            let mut mutated = v.saturating_add(rng.gen_range(-radius..=radius));
            if rng.gen::<f64>() < knobs.negate_probability {
                mutated = mutated.saturating_neg();
            }
            LiteralValue::Int(mutated)
        }
        LiteralValue::Float(v) => {
            let radius = (a as f64) * 10f64.powi(nearest_decade(v.abs()));
            let mut mutated = if radius > 0.0 {
                v + rng.gen_range(-radius..=radius)
            } else {
                *v
            };
            if rng.gen::<f64>() < knobs.negate_probability {
                mutated = -mutated;
            }
            LiteralValue::Float(mutated)
        }
        LiteralValue::Complex { re, im } => {
            let magnitude = re.hypot(*im);
            // atan2 takes the imaginary component first.
            let direction = im.atan2(*re);
            let radius = (a as f64) * 10f64.powi(nearest_decade(magnitude));
            let grown = if radius > 0.0 {
                magnitude + rng.gen_range(-radius..=radius)
            } else {
                magnitude
            };
            let new_magnitude = grown.max(0.0);
            let new_direction = if knobs.max_angle_delta > 0.0 {
                direction + rng.gen_range(-knobs.max_angle_delta..=knobs.max_angle_delta)
            } else {
                direction
            };
            LiteralValue::Complex {
                re: new_magnitude * new_direction.cos(),
                im: new_magnitude * new_direction.sin(),
            }
        }
        LiteralValue::Str(s) => {
            let palette = palette.unwrap_or(&[]);
            let edits = rng.gen_range(1..=knobs.max_string_edits.max(1));
            let mut chars: Vec<char> = s.chars().collect();
            for _ in 0..edits {
                match rng.gen_range(0..3) {
                    0 => {
                        // Insert a palette character at a random split point.
                        if !palette.is_empty() {
                            let at = rng.gen_range(0..=chars.len());
                            let ch = palette[rng.gen_range(0..palette.len())];
                            chars.insert(at, ch);
                        }
                    }
                    1 => {
                        // Remove a random character.
                        if !chars.is_empty() {
                            let at = rng.gen_range(0..chars.len());
                            chars.remove(at);
                        }
                    }
                    _ => {
                        // Replace a random character with a palette character.
                        if !chars.is_empty() && !palette.is_empty() {
                            let at = rng.gen_range(0..chars.len());
                            chars[at] = palette[rng.gen_range(0..palette.len())];
                        }
                    }
                }
            }
            LiteralValue::Str(chars.into_iter().collect())
        }
        LiteralValue::Bool(b) => {
            let mut flipped = *b;
            if rng.gen::<f64>() < knobs.bool_flip_probability {
                flipped = !flipped;
            }
            LiteralValue::Bool(flipped)
        }
        LiteralValue::None => LiteralValue::None,
    }
}
