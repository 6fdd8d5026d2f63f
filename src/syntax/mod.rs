//! Syntax tree model for parsed test bodies.
//!
//! A test body is lowered from the tree-sitter parse into a flattened node
//! table. Every node carries a closed [`NodeKind`], a byte span into the
//! original source, a parent link, and the field/index steps that connect it
//! to its parent. All navigation happens through [`NodeId`] handles; paths
//! are materialized only for display and memo keys.

mod parser;

pub use parser::parse_test_source;

use std::fmt;
use std::ops::Range;

/// Handle into a [`SyntaxTree`]'s node table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One step of a node's path: a named field or an index within a list field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathStep {
    Field(&'static str),
    Index(usize),
}

impl fmt::Display for PathStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathStep::Field(name) => write!(f, ".{}", name),
            PathStep::Index(i) => write!(f, "[{}]", i),
        }
    }
}

/// Which container syntax produced a [`NodeKind::Container`] node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    List,
    Tuple,
    Set,
    Dict,
}

/// A literal value carried by a [`NodeKind::Literal`] node.
#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    Int(i64),
    Float(f64),
    Complex { re: f64, im: f64 },
    Str(String),
    Bool(bool),
    None,
}

impl LiteralValue {
    /// Canonical name used as the key into the dataflow graph. Two literals
    /// with the same value share a key, mirroring how repeated occurrences
    /// of a name share one.
    pub fn canonical(&self) -> String {
        match self {
            LiteralValue::Int(v) => v.to_string(),
            LiteralValue::Float(v) => format_float(*v),
            LiteralValue::Complex { re, im } => {
                if *im >= 0.0 {
                    format!("({}+{}j)", format_float(*re), format_float(*im))
                } else {
                    format!("({}-{}j)", format_float(*re), format_float(-im))
                }
            }
            LiteralValue::Str(s) => s.clone(),
            LiteralValue::Bool(true) => "True".to_string(),
            LiteralValue::Bool(false) => "False".to_string(),
            LiteralValue::None => "None".to_string(),
        }
    }

    /// Render this value as Python source. Template chunks (pieces of an
    /// f-string) are emitted bare, with braces doubled; standalone strings
    /// are quoted and escaped.
    pub fn to_python_source(&self, template_chunk: bool) -> String {
        match self {
            LiteralValue::Int(v) => v.to_string(),
            LiteralValue::Float(v) => format_float(*v),
            LiteralValue::Complex { re, im } => {
                format!("complex({}, {})", format_float(*re), format_float(*im))
            }
            LiteralValue::Str(s) => {
                if template_chunk {
                    escape_template_chunk(s)
                } else {
                    quote_python_string(s)
                }
            }
            LiteralValue::Bool(true) => "True".to_string(),
            LiteralValue::Bool(false) => "False".to_string(),
            LiteralValue::None => "None".to_string(),
        }
    }

}

/// Closed set of node kinds the engine reasons about. Anything else in the
/// grammar lowers to `Other` and is still walked, so no literal can hide.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Module,
    FunctionDef(String),
    ExpressionStmt,
    Assignment,
    Call,
    Attribute(String),
    Name(String),
    Literal(LiteralValue),
    StringTemplate,
    Container(ContainerKind),
    Keyword,
    Other,
}

#[derive(Debug)]
struct SyntaxNode {
    kind: NodeKind,
    span: Range<usize>,
    parent: Option<NodeId>,
    steps: Vec<PathStep>,
    children: Vec<NodeId>,
}

/// Flattened syntax tree for one parsed test body.
#[derive(Debug)]
pub struct SyntaxTree {
    source: String,
    nodes: Vec<SyntaxNode>,
}

impl SyntaxTree {
    pub(crate) fn new(source: String) -> Self {
        Self {
            source,
            nodes: Vec::new(),
        }
    }

    pub(crate) fn push(
        &mut self,
        kind: NodeKind,
        span: Range<usize>,
        parent: Option<NodeId>,
        steps: Vec<PathStep>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(SyntaxNode {
            kind,
            span,
            parent,
            steps,
            children: Vec::new(),
        });
        if let Some(p) = parent {
            self.nodes[p.index()].children.push(id);
        }
        id
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// All node ids in pre-order (the table is built in pre-order).
    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.index()].kind
    }

    pub fn span(&self, id: NodeId) -> Range<usize> {
        self.nodes[id.index()].span.clone()
    }

    pub fn text(&self, id: NodeId) -> &str {
        &self.source[self.nodes[id.index()].span.clone()]
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].parent
    }

    /// The field/index steps connecting this node to its parent.
    pub fn steps(&self, id: NodeId) -> &[PathStep] {
        &self.nodes[id.index()].steps
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.index()].children
    }

    /// The single child reached through `field`, if any.
    pub fn child_by_field(&self, id: NodeId, field: &str) -> Option<NodeId> {
        self.children(id).iter().copied().find(|&c| {
            matches!(self.steps(c), [PathStep::Field(f)] if *f == field)
        })
    }

    /// All children reached through the list field `field`, in index order.
    pub fn children_by_field(&self, id: NodeId, field: &str) -> Vec<NodeId> {
        let mut out: Vec<(usize, NodeId)> = self
            .children(id)
            .iter()
            .copied()
            .filter_map(|c| match self.steps(c) {
                [PathStep::Field(f), PathStep::Index(i)] if *f == field => Some((*i, c)),
                _ => None,
            })
            .collect();
        out.sort_by_key(|(i, _)| *i);
        out.into_iter().map(|(_, c)| c).collect()
    }

    /// Full path from the root, for display and memo keys.
    pub fn path(&self, id: NodeId) -> Vec<PathStep> {
        let mut rev: Vec<PathStep> = Vec::new();
        let mut cursor = Some(id);
        while let Some(c) = cursor {
            for step in self.steps(c).iter().rev() {
                rev.push(*step);
            }
            cursor = self.parent(c);
        }
        rev.reverse();
        rev
    }

    pub fn path_string(&self, id: NodeId) -> String {
        self.path(id).iter().map(|s| s.to_string()).collect()
    }

    /// The name of the function being invoked by a call node: a bare
    /// identifier, or the attribute name qualified by its receiver when the
    /// receiver is itself a name (e.g. `self.assertEqual`).
    pub fn callee_name(&self, call: NodeId) -> Option<String> {
        if !matches!(self.kind(call), NodeKind::Call) {
            return None;
        }
        let func = self.child_by_field(call, "func")?;
        match self.kind(func) {
            NodeKind::Name(name) => Some(name.clone()),
            NodeKind::Attribute(attr) => {
                let object = self.child_by_field(func, "value");
                match object.map(|o| self.kind(o)) {
                    Some(NodeKind::Name(obj)) => Some(format!("{}.{}", obj, attr)),
                    _ => Some(attr.clone()),
                }
            }
            _ => Some(self.text(func).trim().to_string()),
        }
    }

    /// The unqualified method/function name of a call (`assertEqual` for
    /// `self.assertEqual(...)`).
    pub fn callee_basename(&self, call: NodeId) -> Option<String> {
        self.callee_name(call)
            .map(|n| n.rsplit('.').next().unwrap_or("").to_string())
    }

    /// Canonical name used as a dataflow-graph key. Literals use their value,
    /// names their identifier, calls and attributes their qualified name;
    /// everything else falls back to its source text.
    pub fn meaningful_name(&self, id: NodeId) -> String {
        match self.kind(id) {
            NodeKind::Name(name) => name.clone(),
            NodeKind::Literal(value) => value.canonical(),
            NodeKind::Call => self
                .callee_name(id)
                .unwrap_or_else(|| self.text(id).trim().to_string()),
            NodeKind::Attribute(attr) => {
                let object = self.child_by_field(id, "value");
                match object.map(|o| self.kind(o)) {
                    Some(NodeKind::Name(obj)) => format!("{}.{}", obj, attr),
                    _ => self.text(id).trim().to_string(),
                }
            }
            _ => self.text(id).trim().to_string(),
        }
    }

    /// Count of name and call nodes in the subtree rooted at `id`, the node
    /// itself included. Used to weigh assertion arguments against each other.
    pub fn name_and_call_count(&self, id: NodeId) -> usize {
        let mut count = 0;
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            if matches!(self.kind(n), NodeKind::Name(_) | NodeKind::Call) {
                count += 1;
            }
            stack.extend_from_slice(self.children(n));
        }
        count
    }

    /// Number of direct elements of a container node (pairs count once).
    pub fn container_len(&self, id: NodeId) -> usize {
        match self.kind(id) {
            NodeKind::Container(ContainerKind::Dict) => {
                self.children_by_field(id, "keys").len()
            }
            NodeKind::Container(_) => self.children_by_field(id, "elts").len(),
            _ => 0,
        }
    }

    /// Whether `id` sits inside a string template (is a chunk of an f-string).
    pub fn is_template_chunk(&self, id: NodeId) -> bool {
        matches!(
            self.parent(id).map(|p| self.kind(p)),
            Some(NodeKind::StringTemplate)
        )
    }
}

fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

fn quote_python_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out.push('"');
    out
}

fn escape_template_chunk(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '{' => out.push_str("{{"),
            '}' => out.push_str("}}"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(ch),
        }
    }
    out
}
