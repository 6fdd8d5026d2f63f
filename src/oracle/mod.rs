//! Oracle classification over a parsed test body.
//!
//! Builds the assignment dataflow graph (right-hand side flows into
//! assignment targets), flags every node sitting in an oracle argument
//! position of a supported assertion, and propagates "leads to an oracle"
//! transitively through the graph. Literals that lead to an oracle must
//! never be fuzzed, or the mutated test would assert against a mutated
//! expectation and prove nothing.

mod tiebreak;

pub use tiebreak::{AutoGuess, Interactive, Memoized, TieBreakQuery, TieBreakResolver};

use std::collections::{HashMap, HashSet, VecDeque};

use crate::syntax::{NodeId, NodeKind, PathStep, SyntaxTree};

/// Assertions whose first argument is the expected value.
const FIRST_ARG_ORACLES: &[&str] = &[
    "assertEqual",
    "assertNotEqual",
    "assertIs",
    "assertIsNot",
    "assertAlmostEqual",
    "assertNotAlmostEqual",
    "assertGreater",
    "assertGreaterEqual",
    "assertLess",
    "assertLessEqual",
    "assertCountEqual",
    "assertMultiLineEqual",
];

/// Sequence assertions: the elements of the first-argument container are the
/// expected values.
const SEQUENCE_ORACLES: &[&str] = &[
    "assertSequenceEqual",
    "assertListEqual",
    "assertTupleEqual",
    "assertSetEqual",
    "assertDictEqual",
];

/// Containment assertions: the sparser argument is the expected side, and
/// the second argument is inspected per container element.
const CONTAINMENT_ORACLES: &[&str] = &["assertIn", "assertNotIn"];

/// Match assertions: the sparser of the two arguments is the expected side.
const MATCH_ORACLES: &[&str] = &["assertRegexpMatches", "assertNotRegexpMatches"];

/// Assertions where every argument (including keyword values) is an oracle.
const ALL_ARG_ORACLES: &[&str] = &["assertRaisesRegexp", "assertWarnsRegex", "assertLogs"];

// assertTrue/assertFalse/assertIsNone/assertIsNotNone/assertIsInstance/
// assertNotIsInstance/assertRaises/assertWarns carry their oracle in the
// method name, so no argument position is ever flagged for them.

/// Classifier results for one test body.
#[derive(Debug)]
pub struct OracleAnalysis {
    /// Meaningful name -> names it flows into via assignment.
    pub assignment_graph: HashMap<String, Vec<String>>,
    /// Nodes sitting in an oracle argument position.
    pub oracle_nodes: HashSet<NodeId>,
    /// Meaningful names of those nodes.
    pub oracle_names: HashSet<String>,
    /// For every graph key: does it transitively reach an oracle name?
    pub leads_to_oracle: HashMap<String, bool>,
}

impl OracleAnalysis {
    /// Whether the given meaningful name equals or flows into an oracle.
    pub fn name_leads_to_oracle(&self, name: &str) -> bool {
        self.oracle_names.contains(name) || self.leads_to_oracle.get(name).copied().unwrap_or(false)
    }
}

/// Run the classifier over one test body.
pub fn classify(
    tree: &SyntaxTree,
    test_name: &str,
    resolver: &mut dyn TieBreakResolver,
) -> OracleAnalysis {
    let mut analysis = OracleAnalysis {
        assignment_graph: HashMap::new(),
        oracle_nodes: HashSet::new(),
        oracle_names: HashSet::new(),
        leads_to_oracle: HashMap::new(),
    };

    for id in tree.ids() {
        if matches!(
            tree.kind(id),
            NodeKind::Literal(_)
                | NodeKind::Name(_)
                | NodeKind::Call
                | NodeKind::Attribute(_)
                | NodeKind::StringTemplate
        ) {
            record_assignment_edges(tree, id, &mut analysis.assignment_graph);
        }
        if is_oracle_argument(tree, id, test_name, resolver) {
            analysis.oracle_names.insert(tree.meaningful_name(id));
            analysis.oracle_nodes.insert(id);
        }
    }

    propagate(&mut analysis);
    analysis
}

/// If `id` sits on the value side of an assignment, link its meaningful name
/// to every assignment target's meaningful name.
fn record_assignment_edges(
    tree: &SyntaxTree,
    id: NodeId,
    graph: &mut HashMap<String, Vec<String>>,
) {
    let mut child = id;
    let mut parent = tree.parent(id);
    let assignment = loop {
        match parent {
            Some(p) => {
                if matches!(tree.kind(p), NodeKind::Assignment)
                    && tree.steps(child) == [PathStep::Field("value")]
                {
                    break Some(p);
                }
                child = p;
                parent = tree.parent(p);
            }
            None => break None,
        }
    };
    let Some(assignment) = assignment else {
        return;
    };

    let name = tree.meaningful_name(id);
    let entry = graph.entry(name).or_default();
    for target in tree.children_by_field(assignment, "targets") {
        entry.push(tree.meaningful_name(target));
    }
}

/// Breadth-first propagation with a visited set; safe on cyclic graphs.
fn propagate(analysis: &mut OracleAnalysis) {
    let keys: Vec<String> = analysis.assignment_graph.keys().cloned().collect();
    for key in keys {
        let mut reaches = false;
        let mut visited: HashSet<&str> = HashSet::new();
        let mut fringe: VecDeque<&str> = VecDeque::new();
        fringe.push_back(key.as_str());
        while let Some(name) = fringe.pop_front() {
            if !visited.insert(name) {
                continue;
            }
            if analysis.oracle_names.contains(name) {
                reaches = true;
                break;
            }
            if let Some(next) = analysis.assignment_graph.get(name) {
                for n in next {
                    if !visited.contains(n.as_str()) {
                        fringe.push_back(n.as_str());
                    }
                }
            }
        }
        analysis.leads_to_oracle.insert(key, reaches);
    }
}

/// Whether `id` occupies an oracle argument position of any supported
/// assertion call.
fn is_oracle_argument(
    tree: &SyntaxTree,
    id: NodeId,
    test_name: &str,
    resolver: &mut dyn TieBreakResolver,
) -> bool {
    is_first_arg_oracle(tree, id)
        || is_all_arg_oracle(tree, id)
        || is_density_oracle(tree, id, test_name, resolver)
}

fn callee_of(tree: &SyntaxTree, call: NodeId) -> Option<String> {
    matches!(tree.kind(call), NodeKind::Call)
        .then(|| tree.callee_basename(call))
        .flatten()
}

fn is_arg_at(tree: &SyntaxTree, id: NodeId, index: usize) -> Option<NodeId> {
    if tree.steps(id) == [PathStep::Field("args"), PathStep::Index(index)] {
        tree.parent(id)
    } else {
        None
    }
}

fn is_container_element(tree: &SyntaxTree, id: NodeId) -> Option<NodeId> {
    match tree.steps(id) {
        [PathStep::Field("elts" | "keys" | "values"), PathStep::Index(_)] => tree.parent(id),
        _ => None,
    }
}

fn is_first_arg_oracle(tree: &SyntaxTree, id: NodeId) -> bool {
    if let Some(call) = is_arg_at(tree, id, 0) {
        if let Some(callee) = callee_of(tree, call) {
            if FIRST_ARG_ORACLES.contains(&callee.as_str()) {
                return true;
            }
        }
    }
    // Element of the first-argument container of a sequence assertion.
    if let Some(container) = is_container_element(tree, id) {
        if let Some(call) = is_arg_at(tree, container, 0) {
            if let Some(callee) = callee_of(tree, call) {
                if SEQUENCE_ORACLES.contains(&callee.as_str()) {
                    return true;
                }
            }
        }
    }
    false
}

fn is_all_arg_oracle(tree: &SyntaxTree, id: NodeId) -> bool {
    if let [PathStep::Field("args"), PathStep::Index(_)] = tree.steps(id) {
        if let Some(call) = tree.parent(id) {
            if let Some(callee) = callee_of(tree, call) {
                if ALL_ARG_ORACLES.contains(&callee.as_str()) {
                    return true;
                }
            }
        }
    }
    // Keyword argument value: node -(value)-> keyword -(keywords[i])-> call.
    if tree.steps(id) == [PathStep::Field("value")] {
        if let Some(keyword) = tree.parent(id) {
            if matches!(tree.kind(keyword), NodeKind::Keyword) {
                if let Some(call) = tree.parent(keyword) {
                    if let Some(callee) = callee_of(tree, call) {
                        if ALL_ARG_ORACLES.contains(&callee.as_str()) {
                            return true;
                        }
                    }
                }
            }
        }
    }
    false
}

/// Class-2 site: the argument with the fewer name/call references per
/// element is the oracle; ties go to the resolver.
fn is_density_oracle(
    tree: &SyntaxTree,
    id: NodeId,
    test_name: &str,
    resolver: &mut dyn TieBreakResolver,
) -> bool {
    // Identify the call, which argument this node belongs to, and the
    // densities of our side versus the other side.
    let site = find_density_site(tree, id);
    let Some((call, callee, arg_index, ours, theirs)) = site else {
        return false;
    };

    if ours < theirs {
        return true;
    }
    if ours > theirs {
        return false;
    }
    let func = tree.child_by_field(call, "func").unwrap_or(call);
    let query = TieBreakQuery {
        call_path: tree.path_string(func),
        arg_index,
        test_name: test_name.to_string(),
        callee,
        line_text: tree.text(call).trim().to_string(),
    };
    resolver.resolve(&query)
}

fn find_density_site(
    tree: &SyntaxTree,
    id: NodeId,
) -> Option<(NodeId, String, usize, f64, f64)> {
    // Argument 0 of a containment or match assertion.
    if let Some(call) = is_arg_at(tree, id, 0) {
        let callee = callee_of(tree, call)?;
        if CONTAINMENT_ORACLES.contains(&callee.as_str()) {
            let args = tree.children_by_field(call, "args");
            let container = *args.get(1)?;
            let ours = tree.name_and_call_count(id) as f64;
            let elements = tree.container_len(container).max(1) as f64;
            let theirs = tree.name_and_call_count(container) as f64 / elements;
            return Some((call, callee, 0, ours, theirs));
        }
        if MATCH_ORACLES.contains(&callee.as_str()) {
            let args = tree.children_by_field(call, "args");
            let other = *args.get(1)?;
            let ours = tree.name_and_call_count(id) as f64;
            let theirs = tree.name_and_call_count(other) as f64;
            return Some((call, callee, 0, ours, theirs));
        }
        return None;
    }
    // Element of the second-argument container of a containment assertion.
    if let Some(container) = is_container_element(tree, id) {
        if let Some(call) = is_arg_at(tree, container, 1) {
            let callee = callee_of(tree, call)?;
            if CONTAINMENT_ORACLES.contains(&callee.as_str()) {
                let args = tree.children_by_field(call, "args");
                let operand = *args.first()?;
                let elements = tree.container_len(container).max(1) as f64;
                let ours = tree.name_and_call_count(container) as f64 / elements;
                let theirs = tree.name_and_call_count(operand) as f64;
                return Some((call, callee, 1, ours, theirs));
            }
        }
        return None;
    }
    // Second argument of a match assertion.
    if let Some(call) = is_arg_at(tree, id, 1) {
        let callee = callee_of(tree, call)?;
        if MATCH_ORACLES.contains(&callee.as_str()) {
            let args = tree.children_by_field(call, "args");
            let other = *args.first()?;
            let ours = tree.name_and_call_count(id) as f64;
            let theirs = tree.name_and_call_count(other) as f64;
            return Some((call, callee, 1, ours, theirs));
        }
    }
    None
}
