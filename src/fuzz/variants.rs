//! Variant assembly: combining candidate values into runnable test bodies.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::Rng;
use sha2::{Digest, Sha256};

use super::targets::FuzzTarget;
use super::FuzzError;
use crate::syntax::{LiteralValue, NodeKind, SyntaxTree};

/// A fuzz target together with its ordered candidate values.
/// `candidates[0]` is always the original value.
#[derive(Debug, Clone)]
pub struct MutationCandidate {
    pub target: FuzzTarget,
    pub candidates: Vec<LiteralValue>,
}

/// A fully rendered variant body, ready to be placed in the suite file.
#[derive(Debug, Clone)]
pub struct RenderedVariant {
    pub name: String,
    pub body: String,
    pub from_original: bool,
}

/// Pick `requested` deduplicated candidate-index combinations.
///
/// Variants of the original test alter exactly one target each, so a changed
/// outcome is attributable to a single value. Variants of found tests vary
/// all targets freely. The requested count is clamped to the number of
/// distinct combinations actually available.
pub fn assemble_choices(
    candidates: &[MutationCandidate],
    is_original: bool,
    requested: usize,
    test_name: &str,
    rng: &mut StdRng,
) -> Result<Vec<Vec<usize>>, FuzzError> {
    let possible: f64 = if is_original {
        candidates
            .iter()
            .map(|c| (c.candidates.len() - 1) as f64)
            .sum()
    } else {
        candidates
            .iter()
            .map(|c| c.candidates.len() as f64)
            .product()
    };
    let count = (requested as f64).min(possible) as usize;
    if candidates.is_empty() || count == 0 {
        return Err(FuzzError::NoFuzzTargets(test_name.to_string()));
    }

    let mutable: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.candidates.len() > 1)
        .map(|(i, _)| i)
        .collect();
    if is_original && mutable.is_empty() {
        return Err(FuzzError::NoFuzzTargets(test_name.to_string()));
    }

    let mut seen: HashSet<Vec<usize>> = HashSet::new();
    let mut out: Vec<Vec<usize>> = Vec::new();
    while out.len() < count {
        let choice: Vec<usize> = if is_original {
            let altered = mutable[rng.gen_range(0..mutable.len())];
            candidates
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    if i == altered {
                        rng.gen_range(1..c.candidates.len())
                    } else {
                        0
                    }
                })
                .collect()
        } else {
            candidates
                .iter()
                .map(|c| rng.gen_range(0..c.candidates.len()))
                .collect()
        };
        if seen.insert(choice.clone()) {
            out.push(choice);
        }
    }
    Ok(out)
}

/// Materialize one variant: splice the chosen candidate values over the
/// target spans and rename the test function.
pub fn render_variant(
    tree: &SyntaxTree,
    candidates: &[MutationCandidate],
    choice: &[usize],
    new_name: &str,
) -> String {
    let mut replacements: Vec<(std::ops::Range<usize>, String)> = Vec::new();
    for (candidate, &index) in candidates.iter().zip(choice) {
        if index == 0 {
            // Keep the author's original spelling for unchanged targets.
            continue;
        }
        let node = candidate.target.node;
        let text = candidate.candidates[index].to_python_source(tree.is_template_chunk(node));
        replacements.push((tree.span(node), text));
    }
    replacements.sort_by(|a, b| b.0.start.cmp(&a.0.start));

    let mut body = tree.source().to_string();
    for (span, text) in replacements {
        body.replace_range(span, &text);
    }

    if let Some(old_name) = tree.ids().find_map(|id| match tree.kind(id) {
        NodeKind::FunctionDef(name) => Some(name.clone()),
        _ => None,
    }) {
        body = body.replacen(
            &format!("def {}(", old_name),
            &format!("def {}(", new_name),
            1,
        );
    }
    body
}

/// Drop rendered variants whose bodies (ignoring the renamed definition
/// line) duplicate one another.
pub fn dedup_rendered(variants: Vec<RenderedVariant>) -> Vec<RenderedVariant> {
    let mut seen: HashSet<[u8; 32]> = HashSet::new();
    let mut out = Vec::new();
    for variant in variants {
        let digest = body_digest(&variant.body);
        if seen.insert(digest) {
            out.push(variant);
        }
    }
    out
}

fn body_digest(body: &str) -> [u8; 32] {
    let lines: Vec<&str> = body.lines().skip(1).collect();
    let start = lines
        .iter()
        .position(|l| !l.trim().is_empty())
        .unwrap_or(lines.len());
    let end = lines
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .map(|i| i + 1)
        .unwrap_or(start);
    let mut hasher = Sha256::new();
    for line in &lines[start..end] {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().into()
}

/// Split a total variant budget across the input tests: roughly half to the
/// original test, the remainder round-robin over the found tests.
pub fn allocate_counts(total: usize, test_count: usize, original_index: usize) -> Vec<usize> {
    if test_count == 1 {
        return vec![total];
    }
    let mut counts = vec![0usize; test_count];
    counts[original_index] = total.div_ceil(2);
    let mut assigned = counts[original_index];
    let mut cursor = 0;
    while assigned < total {
        if cursor != original_index {
            counts[cursor] += 1;
            assigned += 1;
        }
        cursor = (cursor + 1) % test_count;
    }
    counts
}

/// Assemble the generated suite file: hoisted deduplicated imports, one
/// unittest class wrapper, and every variant body indented into it.
pub fn build_suite(import_lines: &[String], variants: &[RenderedVariant]) -> String {
    let mut imports: Vec<String> = vec!["import unittest".to_string()];
    for line in import_lines {
        let line = line.trim_end();
        if !imports.iter().any(|existing| existing == line) {
            imports.push(line.to_string());
        }
    }

    let mut out = String::new();
    for import in &imports {
        out.push_str(import);
        out.push('\n');
    }
    out.push_str("\n\nclass TestFuzzed(unittest.TestCase):\n");
    for variant in variants {
        for line in variant.body.lines() {
            if line.trim().is_empty() {
                out.push('\n');
            } else {
                out.push_str("    ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::{parse_test_source, NodeId};
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(11)
    }

    fn int_candidate(node: NodeId, values: &[i64]) -> MutationCandidate {
        MutationCandidate {
            target: FuzzTarget {
                node,
                value: LiteralValue::Int(values[0]),
            },
            candidates: values.iter().map(|v| LiteralValue::Int(*v)).collect(),
        }
    }

    fn literal_nodes(tree: &SyntaxTree) -> Vec<NodeId> {
        tree.ids()
            .filter(|id| matches!(tree.kind(*id), NodeKind::Literal(_)))
            .collect()
    }

    // =========================================================================
    // Choice assembly tests
    // =========================================================================

    #[test]
    fn test_original_variants_alter_exactly_one_target() {
        let tree = parse_test_source("a = 1\nb = 2\n").unwrap();
        let nodes = literal_nodes(&tree);
        let candidates = vec![
            int_candidate(nodes[0], &[1, 10, 11]),
            int_candidate(nodes[1], &[2, 20, 21]),
        ];
        let choices = assemble_choices(&candidates, true, 4, "test_x", &mut rng()).unwrap();
        assert_eq!(choices.len(), 4);
        for choice in &choices {
            let altered = choice.iter().filter(|&&i| i != 0).count();
            assert_eq!(altered, 1);
        }
    }

    #[test]
    fn test_found_variants_vary_freely_and_clamp_to_space() {
        let tree = parse_test_source("a = 1\nb = 2\n").unwrap();
        let nodes = literal_nodes(&tree);
        let candidates = vec![
            int_candidate(nodes[0], &[1, 10]),
            int_candidate(nodes[1], &[2, 20]),
        ];
        // Only 2*2 = 4 combinations exist.
        let choices = assemble_choices(&candidates, false, 50, "test_x", &mut rng()).unwrap();
        assert_eq!(choices.len(), 4);
        let distinct: HashSet<_> = choices.iter().cloned().collect();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn test_original_space_is_sum_of_alterations() {
        let tree = parse_test_source("a = 1\nb = 2\n").unwrap();
        let nodes = literal_nodes(&tree);
        let candidates = vec![
            int_candidate(nodes[0], &[1, 10]),
            int_candidate(nodes[1], &[2, 20]),
        ];
        // One alteration per variant: 1 + 1 = 2 possibilities.
        let choices = assemble_choices(&candidates, true, 50, "test_x", &mut rng()).unwrap();
        assert_eq!(choices.len(), 2);
    }

    #[test]
    fn test_no_targets_is_an_error() {
        let result = assemble_choices(&[], true, 5, "test_empty", &mut rng());
        assert!(matches!(result, Err(FuzzError::NoFuzzTargets(name)) if name == "test_empty"));
    }

    #[test]
    fn test_unalterable_targets_are_an_error_for_original() {
        let tree = parse_test_source("a = 1\n").unwrap();
        let nodes = literal_nodes(&tree);
        let candidates = vec![int_candidate(nodes[0], &[1])];
        let result = assemble_choices(&candidates, true, 5, "test_x", &mut rng());
        assert!(result.is_err());
    }

    // =========================================================================
    // Rendering tests
    // =========================================================================

    #[test]
    fn test_render_replaces_value_and_name() {
        let source = "def test_add(self):\n    a = 5\n    self.assertEqual(10, add(a))\n";
        let tree = parse_test_source(source).unwrap();
        let five = tree
            .ids()
            .find(|id| matches!(tree.kind(*id), NodeKind::Literal(LiteralValue::Int(5))))
            .unwrap();
        let candidates = vec![int_candidate(five, &[5, 41])];
        let body = render_variant(&tree, &candidates, &[1], "test_fuzzed_0_from_original");
        assert!(body.contains("a = 41"));
        assert!(body.contains("def test_fuzzed_0_from_original(self):"));
        assert!(!body.contains("def test_add("));
        // The oracle argument is untouched.
        assert!(body.contains("self.assertEqual(10, add(a))"));
    }

    #[test]
    fn test_render_keeps_original_spelling_for_unchanged_targets() {
        let source = "def test_x(self):\n    a = 0x10\n";
        let tree = parse_test_source(source).unwrap();
        let node = literal_nodes(&tree)[0];
        let candidates = vec![int_candidate(node, &[16, 20])];
        let body = render_variant(&tree, &candidates, &[0], "test_fuzzed_1_from_original");
        assert!(body.contains("a = 0x10"));
    }

    #[test]
    fn test_render_string_requotes() {
        let source = "def test_x(self):\n    s = 'ab'\n";
        let tree = parse_test_source(source).unwrap();
        let node = literal_nodes(&tree)[0];
        let candidates = vec![MutationCandidate {
            target: FuzzTarget {
                node,
                value: LiteralValue::Str("ab".into()),
            },
            candidates: vec![
                LiteralValue::Str("ab".into()),
                LiteralValue::Str("a\"b".into()),
            ],
        }];
        let body = render_variant(&tree, &candidates, &[1], "test_fuzzed_2_from_original");
        assert!(body.contains("s = \"a\\\"b\""));
    }

    #[test]
    fn test_render_multiple_replacements_on_one_line() {
        let source = "def test_x(self):\n    a = f(1, 2)\n";
        let tree = parse_test_source(source).unwrap();
        let nodes = literal_nodes(&tree);
        let candidates = vec![
            int_candidate(nodes[0], &[1, 100]),
            int_candidate(nodes[1], &[2, 200]),
        ];
        let body = render_variant(&tree, &candidates, &[1, 1], "test_fuzzed_3_from_found");
        assert!(body.contains("a = f(100, 200)"));
    }

    // =========================================================================
    // Dedup and allocation tests
    // =========================================================================

    #[test]
    fn test_dedup_ignores_definition_line() {
        let variants = vec![
            RenderedVariant {
                name: "test_fuzzed_0_from_original".into(),
                body: "def test_fuzzed_0_from_original(self):\n    a = 1\n".into(),
                from_original: true,
            },
            RenderedVariant {
                name: "test_fuzzed_1_from_original".into(),
                body: "def test_fuzzed_1_from_original(self):\n    a = 1\n".into(),
                from_original: true,
            },
            RenderedVariant {
                name: "test_fuzzed_2_from_original".into(),
                body: "def test_fuzzed_2_from_original(self):\n    a = 2\n".into(),
                from_original: true,
            },
        ];
        let deduped = dedup_rendered(variants);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].name, "test_fuzzed_0_from_original");
    }

    #[test]
    fn test_allocation_single_test_takes_all() {
        assert_eq!(allocate_counts(20, 1, 0), vec![20]);
    }

    #[test]
    fn test_allocation_half_to_original_rest_round_robin() {
        assert_eq!(allocate_counts(20, 3, 0), vec![10, 5, 5]);
        assert_eq!(allocate_counts(21, 3, 1), vec![5, 11, 5]);
    }

    #[test]
    fn test_allocation_sums_to_total() {
        for total in [1, 7, 50] {
            for tests in [2, 3, 5] {
                let counts = allocate_counts(total, tests, 0);
                assert_eq!(counts.iter().sum::<usize>(), total);
            }
        }
    }

    // =========================================================================
    // Suite assembly tests
    // =========================================================================

    #[test]
    fn test_suite_hoists_and_dedups_imports() {
        let imports = vec![
            "import unittest".to_string(),
            "from widgets import Widget".to_string(),
            "from widgets import Widget".to_string(),
        ];
        let variants = vec![RenderedVariant {
            name: "test_fuzzed_0_from_original".into(),
            body: "def test_fuzzed_0_from_original(self):\n    a = 1\n".into(),
            from_original: true,
        }];
        let suite = build_suite(&imports, &variants);
        assert!(suite.starts_with("import unittest\nfrom widgets import Widget\n"));
        assert_eq!(suite.matches("from widgets import Widget").count(), 1);
        assert!(suite.contains("class TestFuzzed(unittest.TestCase):\n"));
        assert!(suite.contains("    def test_fuzzed_0_from_original(self):\n        a = 1\n"));
    }
}
