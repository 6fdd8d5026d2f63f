//! Selection of the literals eligible for mutation.

use crate::oracle::OracleAnalysis;
use crate::syntax::{LiteralValue, NodeId, NodeKind, PathStep, SyntaxTree};

/// A literal node eligible for mutation, with its original value.
#[derive(Debug, Clone)]
pub struct FuzzTarget {
    pub node: NodeId,
    pub value: LiteralValue,
}

/// Collect the fuzzable literals of a test body, in source order.
///
/// A literal qualifies unless it is the test's leading docstring, its value
/// transitively feeds an oracle through the assignment graph, or it sits in
/// an oracle argument position itself. `None` literals are never fuzzed;
/// there is no second value to move them to that keeps the test shape.
pub fn select_targets(tree: &SyntaxTree, analysis: &OracleAnalysis) -> Vec<FuzzTarget> {
    let mut out = Vec::new();
    for id in tree.ids() {
        let NodeKind::Literal(value) = tree.kind(id) else {
            continue;
        };
        if matches!(value, LiteralValue::None) {
            continue;
        }
        if is_leading_docstring(tree, id) {
            continue;
        }
        if analysis.name_leads_to_oracle(&value.canonical()) {
            continue;
        }
        if analysis.oracle_nodes.contains(&id) {
            continue;
        }
        out.push(FuzzTarget {
            node: id,
            value: value.clone(),
        });
    }
    out
}

/// Structural docstring check: a bare string expression that is the first
/// statement of the test's function body.
fn is_leading_docstring(tree: &SyntaxTree, id: NodeId) -> bool {
    if !matches!(tree.kind(id), NodeKind::Literal(LiteralValue::Str(_))) {
        return false;
    }
    let Some(stmt) = tree.parent(id) else {
        return false;
    };
    if !matches!(tree.kind(stmt), NodeKind::ExpressionStmt)
        || tree.steps(id) != [PathStep::Field("value")]
    {
        return false;
    }
    if tree.steps(stmt) != [PathStep::Field("body"), PathStep::Index(0)] {
        return false;
    }
    matches!(
        tree.parent(stmt).map(|p| tree.kind(p)),
        Some(NodeKind::FunctionDef(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{classify, AutoGuess};
    use crate::syntax::parse_test_source;

    fn targets(source: &str) -> Vec<LiteralValue> {
        let tree = parse_test_source(source).unwrap();
        let analysis = classify(&tree, "test_case", &mut AutoGuess);
        select_targets(&tree, &analysis)
            .into_iter()
            .map(|t| t.value)
            .collect()
    }

    #[test]
    fn test_free_literal_selected() {
        let source = "def test_case(self):\n    a = 5\n    b = a\n    self.assertEqual(10, b)\n";
        let selected = targets(source);
        // 5 flows into b, but b never reaches the oracle value 10, so 5 is
        // free. The oracle literal itself is excluded.
        assert_eq!(selected, vec![LiteralValue::Int(5)]);
    }

    #[test]
    fn test_oracle_ancestor_excluded() {
        let source =
            "def test_case(self):\n    a = 5\n    expected = a\n    self.assertEqual(expected, run(3))\n";
        let selected = targets(source);
        assert!(!selected.contains(&LiteralValue::Int(5)));
        assert!(selected.contains(&LiteralValue::Int(3)));
    }

    #[test]
    fn test_docstring_excluded() {
        let source =
            "def test_case(self):\n    \"\"\"Checks the widget.\"\"\"\n    self.assertTrue(run(\"on\"))\n";
        let selected = targets(source);
        assert_eq!(selected, vec![LiteralValue::Str("on".into())]);
    }

    #[test]
    fn test_later_bare_string_is_not_a_docstring() {
        let source = "def test_case(self):\n    run()\n    \"marker\"\n";
        let selected = targets(source);
        assert_eq!(selected, vec![LiteralValue::Str("marker".into())]);
    }

    #[test]
    fn test_oracle_argument_literal_excluded() {
        let source = "def test_case(self):\n    self.assertEqual(10, compute(7))\n";
        let selected = targets(source);
        assert_eq!(selected, vec![LiteralValue::Int(7)]);
    }

    #[test]
    fn test_sequence_oracle_elements_excluded() {
        let source = "def test_case(self):\n    self.assertListEqual([1, 2], build(9))\n";
        let selected = targets(source);
        assert_eq!(selected, vec![LiteralValue::Int(9)]);
    }

    #[test]
    fn test_none_literal_never_selected() {
        let source = "def test_case(self):\n    self.assertEqual(1, f(None, 4))\n";
        let selected = targets(source);
        assert_eq!(selected, vec![LiteralValue::Int(4)]);
    }

    #[test]
    fn test_template_chunks_selected() {
        let source = "def test_case(self):\n    n = 3\n    self.assertTrue(check(f\"n={n}!\"))\n";
        let selected = targets(source);
        assert!(selected.contains(&LiteralValue::Int(3)));
        assert!(selected.contains(&LiteralValue::Str("n=".into())));
        assert!(selected.contains(&LiteralValue::Str("!".into())));
    }

    #[test]
    fn test_selection_order_is_source_order() {
        let source = "def test_case(self):\n    a = f(1, 2)\n    b = g(3)\n";
        let selected = targets(source);
        assert_eq!(
            selected,
            vec![
                LiteralValue::Int(1),
                LiteralValue::Int(2),
                LiteralValue::Int(3)
            ]
        );
    }
}
