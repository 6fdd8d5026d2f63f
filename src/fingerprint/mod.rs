//! Call-sequence fingerprinting.
//!
//! A test's fingerprint is the ordered list of names it invokes, arguments
//! ignored. Two tests with identical fingerprints exercise the same code
//! shape, which makes an existing test worth fuzzing alongside the failing
//! one.

use crate::syntax::{NodeId, NodeKind, SyntaxTree};

/// Ordered sequence of invoked names, in source encounter order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFingerprint(Vec<String>);

impl CallFingerprint {
    /// Collect every call's invoked name by walking the tree in pre-order.
    /// Method calls record the attribute name (`assertEqual` for
    /// `self.assertEqual(...)`); constructor calls record the class name.
    pub fn of(tree: &SyntaxTree) -> Self {
        let mut names = Vec::new();
        collect(tree, tree.root(), &mut names);
        CallFingerprint(names)
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    /// Call-similar: same names in the same order.
    pub fn matches(&self, other: &CallFingerprint) -> bool {
        self.0 == other.0
    }
}

fn collect(tree: &SyntaxTree, id: NodeId, names: &mut Vec<String>) {
    if matches!(tree.kind(id), NodeKind::Call) {
        if let Some(func) = tree.child_by_field(id, "func") {
            let name = match tree.kind(func) {
                NodeKind::Name(n) => n.clone(),
                NodeKind::Attribute(attr) => attr.clone(),
                _ => tree.text(func).trim().to_string(),
            };
            names.push(name);
        }
    }
    for &child in tree.children(id) {
        collect(tree, child, names);
    }
}
