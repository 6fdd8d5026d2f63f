//! Lowering from the tree-sitter parse tree into the flattened node table.

use anyhow::{bail, Context, Result};
use tree_sitter::Node as TsNode;

use super::{ContainerKind, LiteralValue, NodeId, NodeKind, PathStep, SyntaxTree};

/// Parse a dedented Python test (a `def test_*` at column zero) into a
/// [`SyntaxTree`]. The module wrapper produced by the parser stays as the
/// root node, so a test body lives at `.body[0]`.
pub fn parse_test_source(source: &str) -> Result<SyntaxTree> {
    let mut parser = tree_sitter::Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .context("Failed to load Python grammar")?;
    let ts_tree = parser
        .parse(source, None)
        .context("Parser returned no tree")?;
    let root = ts_tree.root_node();
    if root.has_error() {
        bail!("test source does not parse as Python:\n{}", source);
    }

    let mut tree = SyntaxTree::new(source.to_string());
    let module = tree.push(NodeKind::Module, root.byte_range(), None, Vec::new());
    for (i, stmt) in named_children(root).into_iter().enumerate() {
        lower(&mut tree, source, stmt, module, list_step("body", i));
    }
    Ok(tree)
}

fn list_step(field: &'static str, index: usize) -> Vec<PathStep> {
    vec![PathStep::Field(field), PathStep::Index(index)]
}

fn single_step(field: &'static str) -> Vec<PathStep> {
    vec![PathStep::Field(field)]
}

fn named_children(node: TsNode<'_>) -> Vec<TsNode<'_>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor)
        .filter(|c| c.kind() != "comment")
        .collect()
}

fn node_text<'a>(source: &'a str, node: TsNode<'_>) -> &'a str {
    &source[node.byte_range()]
}

fn lower(tree: &mut SyntaxTree, source: &str, ts: TsNode<'_>, parent: NodeId, steps: Vec<PathStep>) {
    match ts.kind() {
        "function_definition" => {
            let name = ts
                .child_by_field_name("name")
                .map(|n| node_text(source, n).to_string())
                .unwrap_or_default();
            let id = tree.push(NodeKind::FunctionDef(name), ts.byte_range(), Some(parent), steps);
            if let Some(body) = ts.child_by_field_name("body") {
                for (i, stmt) in named_children(body).into_iter().enumerate() {
                    lower(tree, source, stmt, id, list_step("body", i));
                }
            }
        }
        "decorated_definition" => {
            if let Some(def) = ts.child_by_field_name("definition") {
                lower(tree, source, def, parent, steps);
            }
        }
        "expression_statement" => {
            let id = tree.push(NodeKind::ExpressionStmt, ts.byte_range(), Some(parent), steps);
            for (i, child) in named_children(ts).into_iter().enumerate() {
                if i == 0 {
                    lower(tree, source, child, id, single_step("value"));
                } else {
                    lower(tree, source, child, id, list_step("children", i));
                }
            }
        }
        "assignment" => {
            let id = tree.push(NodeKind::Assignment, ts.byte_range(), Some(parent), steps);
            if let Some(left) = ts.child_by_field_name("left") {
                match left.kind() {
                    "pattern_list" | "tuple_pattern" | "tuple" => {
                        for (i, target) in named_children(left).into_iter().enumerate() {
                            lower(tree, source, target, id, list_step("targets", i));
                        }
                    }
                    _ => lower(tree, source, left, id, list_step("targets", 0)),
                }
            }
            if let Some(right) = ts.child_by_field_name("right") {
                lower(tree, source, right, id, single_step("value"));
            }
        }
        "call" => {
            let id = tree.push(NodeKind::Call, ts.byte_range(), Some(parent), steps);
            if let Some(func) = ts.child_by_field_name("function") {
                lower(tree, source, func, id, single_step("func"));
            }
            if let Some(arguments) = ts.child_by_field_name("arguments") {
                let mut positional = 0;
                let mut keyword = 0;
                for arg in named_children(arguments) {
                    if arg.kind() == "keyword_argument" {
                        let kw = tree.push(
                            NodeKind::Keyword,
                            arg.byte_range(),
                            Some(id),
                            list_step("keywords", keyword),
                        );
                        keyword += 1;
                        if let Some(value) = arg.child_by_field_name("value") {
                            lower(tree, source, value, kw, single_step("value"));
                        }
                    } else {
                        lower(tree, source, arg, id, list_step("args", positional));
                        positional += 1;
                    }
                }
            }
        }
        "attribute" => {
            let attr = ts
                .child_by_field_name("attribute")
                .map(|n| node_text(source, n).to_string())
                .unwrap_or_default();
            let id = tree.push(NodeKind::Attribute(attr), ts.byte_range(), Some(parent), steps);
            if let Some(object) = ts.child_by_field_name("object") {
                lower(tree, source, object, id, single_step("value"));
            }
        }
        "identifier" => {
            let name = node_text(source, ts).to_string();
            tree.push(NodeKind::Name(name), ts.byte_range(), Some(parent), steps);
        }
        "integer" => {
            let kind = parse_integer(node_text(source, ts));
            tree.push(kind, ts.byte_range(), Some(parent), steps);
        }
        "float" => {
            let kind = parse_float(node_text(source, ts));
            tree.push(kind, ts.byte_range(), Some(parent), steps);
        }
        "true" => {
            tree.push(
                NodeKind::Literal(LiteralValue::Bool(true)),
                ts.byte_range(),
                Some(parent),
                steps,
            );
        }
        "false" => {
            tree.push(
                NodeKind::Literal(LiteralValue::Bool(false)),
                ts.byte_range(),
                Some(parent),
                steps,
            );
        }
        "none" => {
            tree.push(
                NodeKind::Literal(LiteralValue::None),
                ts.byte_range(),
                Some(parent),
                steps,
            );
        }
        "string" => lower_string(tree, source, ts, parent, steps),
        "list" => lower_container(tree, source, ts, parent, steps, ContainerKind::List),
        "tuple" => lower_container(tree, source, ts, parent, steps, ContainerKind::Tuple),
        "set" => lower_container(tree, source, ts, parent, steps, ContainerKind::Set),
        "dictionary" => {
            let id = tree.push(
                NodeKind::Container(ContainerKind::Dict),
                ts.byte_range(),
                Some(parent),
                steps,
            );
            for (i, pair) in named_children(ts).into_iter().enumerate() {
                if let Some(key) = pair.child_by_field_name("key") {
                    lower(tree, source, key, id, list_step("keys", i));
                }
                if let Some(value) = pair.child_by_field_name("value") {
                    lower(tree, source, value, id, list_step("values", i));
                }
            }
        }
        "parenthesized_expression" => {
            // Transparent: parentheses do not change a node's position.
            if let Some(inner) = named_children(ts).into_iter().next() {
                lower(tree, source, inner, parent, steps);
            }
        }
        "unary_operator" => {
            let id = tree.push(NodeKind::Other, ts.byte_range(), Some(parent), steps);
            if let Some(argument) = ts.child_by_field_name("argument") {
                lower(tree, source, argument, id, single_step("operand"));
            }
        }
        _ => {
            let id = tree.push(NodeKind::Other, ts.byte_range(), Some(parent), steps);
            for (i, child) in named_children(ts).into_iter().enumerate() {
                lower(tree, source, child, id, list_step("children", i));
            }
        }
    }
}

fn lower_container(
    tree: &mut SyntaxTree,
    source: &str,
    ts: TsNode<'_>,
    parent: NodeId,
    steps: Vec<PathStep>,
    kind: ContainerKind,
) {
    let id = tree.push(NodeKind::Container(kind), ts.byte_range(), Some(parent), steps);
    for (i, element) in named_children(ts).into_iter().enumerate() {
        lower(tree, source, element, id, list_step("elts", i));
    }
}

fn lower_string(tree: &mut SyntaxTree, source: &str, ts: TsNode<'_>, parent: NodeId, steps: Vec<PathStep>) {
    let raw = string_prefix(source, ts).contains(['r', 'R']);
    let mut cursor = ts.walk();
    let children: Vec<TsNode<'_>> = ts.children(&mut cursor).collect();
    let has_interpolation = children.iter().any(|c| c.kind() == "interpolation");

    if has_interpolation {
        let id = tree.push(NodeKind::StringTemplate, ts.byte_range(), Some(parent), steps);
        let mut index = 0;
        // Merge adjacent content/escape runs into one chunk so a fuzz target
        // covers a whole textual piece of the template.
        let mut run_start: Option<usize> = None;
        let mut run_end = 0;
        let mut run_value = String::new();
        let mut flush = |tree: &mut SyntaxTree,
                         run_start: &mut Option<usize>,
                         run_end: usize,
                         run_value: &mut String,
                         index: &mut usize| {
            if let Some(start) = run_start.take() {
                tree.push(
                    NodeKind::Literal(LiteralValue::Str(std::mem::take(run_value))),
                    start..run_end,
                    Some(id),
                    list_step("values", *index),
                );
                *index += 1;
            }
        };
        for child in &children {
            match child.kind() {
                "string_content" | "escape_sequence" => {
                    if run_start.is_none() {
                        run_start = Some(child.start_byte());
                    }
                    run_end = child.end_byte();
                    run_value.push_str(&decode_piece(node_text(source, *child), raw, child.kind()));
                }
                "interpolation" => {
                    flush(tree, &mut run_start, run_end, &mut run_value, &mut index);
                    let inner = named_children(*child).into_iter().next();
                    if let Some(expr) = inner {
                        lower(tree, source, expr, id, list_step("values", index));
                        index += 1;
                    }
                }
                _ => {}
            }
        }
        flush(tree, &mut run_start, run_end, &mut run_value, &mut index);
    } else {
        let mut value = String::new();
        for child in &children {
            match child.kind() {
                "string_content" | "escape_sequence" => {
                    value.push_str(&decode_piece(node_text(source, *child), raw, child.kind()));
                }
                _ => {}
            }
        }
        tree.push(
            NodeKind::Literal(LiteralValue::Str(value)),
            ts.byte_range(),
            Some(parent),
            steps,
        );
    }
}

fn string_prefix<'a>(source: &'a str, ts: TsNode<'_>) -> &'a str {
    let mut cursor = ts.walk();
    for child in ts.children(&mut cursor) {
        if child.kind() == "string_start" {
            let text = node_text(source, child);
            return text.trim_end_matches(['"', '\'']);
        }
    }
    ""
}

fn decode_piece(text: &str, raw: bool, kind: &str) -> String {
    if raw || kind != "escape_sequence" {
        return text.to_string();
    }
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some('\\'), Some(esc)) => match esc {
            'n' => "\n".to_string(),
            't' => "\t".to_string(),
            'r' => "\r".to_string(),
            '0' => "\0".to_string(),
            '\\' => "\\".to_string(),
            '\'' => "'".to_string(),
            '"' => "\"".to_string(),
            'x' => u8::from_str_radix(&text[2..], 16)
                .map(|b| (b as char).to_string())
                .unwrap_or_else(|_| text.to_string()),
            _ => text.to_string(),
        },
        _ => text.to_string(),
    }
}

fn parse_integer(text: &str) -> NodeKind {
    let cleaned: String = text.chars().filter(|c| *c != '_').collect();
    if let Some(imag) = cleaned.strip_suffix(['j', 'J']) {
        if let Ok(im) = imag.parse::<f64>() {
            return NodeKind::Literal(LiteralValue::Complex { re: 0.0, im });
        }
    }
    let parsed = if let Some(hex) = cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)
    } else if let Some(oct) = cleaned.strip_prefix("0o").or_else(|| cleaned.strip_prefix("0O")) {
        i64::from_str_radix(oct, 8)
    } else if let Some(bin) = cleaned.strip_prefix("0b").or_else(|| cleaned.strip_prefix("0B")) {
        i64::from_str_radix(bin, 2)
    } else {
        cleaned.parse::<i64>()
    };
    match parsed {
        Ok(v) => NodeKind::Literal(LiteralValue::Int(v)),
        Err(_) => NodeKind::Other,
    }
}

fn parse_float(text: &str) -> NodeKind {
    let cleaned: String = text.chars().filter(|c| *c != '_').collect();
    if let Some(imag) = cleaned.strip_suffix(['j', 'J']) {
        if let Ok(im) = imag.parse::<f64>() {
            return NodeKind::Literal(LiteralValue::Complex { re: 0.0, im });
        }
    }
    match cleaned.parse::<f64>() {
        Ok(v) => NodeKind::Literal(LiteralValue::Float(v)),
        Err(_) => NodeKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> SyntaxTree {
        parse_test_source(source).unwrap()
    }

    fn literals(tree: &SyntaxTree) -> Vec<LiteralValue> {
        tree.ids()
            .filter_map(|id| match tree.kind(id) {
                NodeKind::Literal(v) => Some(v.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_parse_simple_test_body() {
        let tree = parse("def test_add(self):\n    a = 5\n    self.assertEqual(10, a)\n");
        let root = tree.root();
        assert!(matches!(tree.kind(root), NodeKind::Module));
        let def = tree.children_by_field(root, "body")[0];
        assert!(matches!(tree.kind(def), NodeKind::FunctionDef(name) if name == "test_add"));
        assert_eq!(
            literals(&tree),
            vec![LiteralValue::Int(5), LiteralValue::Int(10)]
        );
    }

    #[test]
    fn test_assignment_targets_and_value() {
        let tree = parse("x = compute(3)\n");
        let assign = tree
            .ids()
            .find(|id| matches!(tree.kind(*id), NodeKind::Assignment))
            .unwrap();
        let targets = tree.children_by_field(assign, "targets");
        assert_eq!(targets.len(), 1);
        assert!(matches!(tree.kind(targets[0]), NodeKind::Name(n) if n == "x"));
        let value = tree.child_by_field(assign, "value").unwrap();
        assert!(matches!(tree.kind(value), NodeKind::Call));
    }

    #[test]
    fn test_tuple_assignment_targets() {
        let tree = parse("a, b = 1, 2\n");
        let assign = tree
            .ids()
            .find(|id| matches!(tree.kind(*id), NodeKind::Assignment))
            .unwrap();
        assert_eq!(tree.children_by_field(assign, "targets").len(), 2);
    }

    #[test]
    fn test_call_shape() {
        let tree = parse("self.assertEqual(10, b)\n");
        let call = tree
            .ids()
            .find(|id| matches!(tree.kind(*id), NodeKind::Call))
            .unwrap();
        assert_eq!(tree.callee_name(call).unwrap(), "self.assertEqual");
        assert_eq!(tree.callee_basename(call).unwrap(), "assertEqual");
        let args = tree.children_by_field(call, "args");
        assert_eq!(args.len(), 2);
        assert!(matches!(
            tree.kind(args[0]),
            NodeKind::Literal(LiteralValue::Int(10))
        ));
        assert_eq!(
            tree.steps(args[0]),
            &[PathStep::Field("args"), PathStep::Index(0)]
        );
    }

    #[test]
    fn test_keyword_argument_value_path() {
        let tree = parse("self.assertRaisesRegexp(ValueError, msg=\"boom\")\n");
        let kw_value = tree
            .ids()
            .find(|id| matches!(tree.kind(*id), NodeKind::Literal(LiteralValue::Str(_))))
            .unwrap();
        assert_eq!(tree.steps(kw_value), &[PathStep::Field("value")]);
        let kw = tree.parent(kw_value).unwrap();
        assert!(matches!(tree.kind(kw), NodeKind::Keyword));
        assert_eq!(
            tree.steps(kw),
            &[PathStep::Field("keywords"), PathStep::Index(0)]
        );
    }

    #[test]
    fn test_string_literal_value_and_span() {
        let source = "msg = \"ab\\ncd\"\n";
        let tree = parse(source);
        let lit = tree
            .ids()
            .find(|id| matches!(tree.kind(*id), NodeKind::Literal(LiteralValue::Str(_))))
            .unwrap();
        match tree.kind(lit) {
            NodeKind::Literal(LiteralValue::Str(s)) => assert_eq!(s, "ab\ncd"),
            _ => unreachable!(),
        }
        // Span covers the quotes so a replacement swaps the whole literal.
        assert_eq!(tree.text(lit), "\"ab\\ncd\"");
    }

    #[test]
    fn test_fstring_lowers_to_template_chunks() {
        let tree = parse("msg = f\"count={n} done\"\n");
        let template = tree
            .ids()
            .find(|id| matches!(tree.kind(*id), NodeKind::StringTemplate))
            .unwrap();
        let parts = tree.children_by_field(template, "values");
        assert_eq!(parts.len(), 3);
        assert!(matches!(
            tree.kind(parts[0]),
            NodeKind::Literal(LiteralValue::Str(s)) if s == "count="
        ));
        assert!(matches!(tree.kind(parts[1]), NodeKind::Name(n) if n == "n"));
        assert!(tree.is_template_chunk(parts[0]));
    }

    #[test]
    fn test_container_lowering() {
        let tree = parse("self.assertIn(5, [0, 10])\n");
        let container = tree
            .ids()
            .find(|id| matches!(tree.kind(*id), NodeKind::Container(ContainerKind::List)))
            .unwrap();
        assert_eq!(tree.container_len(container), 2);
        assert_eq!(
            tree.steps(container),
            &[PathStep::Field("args"), PathStep::Index(1)]
        );
    }

    #[test]
    fn test_dict_lowering() {
        let tree = parse("d = {\"k\": 1, \"j\": 2}\n");
        let dict = tree
            .ids()
            .find(|id| matches!(tree.kind(*id), NodeKind::Container(ContainerKind::Dict)))
            .unwrap();
        assert_eq!(tree.container_len(dict), 2);
        assert_eq!(tree.children_by_field(dict, "keys").len(), 2);
        assert_eq!(tree.children_by_field(dict, "values").len(), 2);
    }

    #[test]
    fn test_numeric_literal_forms() {
        let tree = parse("a = 1_000\nb = 2.5\nc = 3j\nd = 0x10\n");
        assert_eq!(
            literals(&tree),
            vec![
                LiteralValue::Int(1000),
                LiteralValue::Float(2.5),
                LiteralValue::Complex { re: 0.0, im: 3.0 },
                LiteralValue::Int(16),
            ]
        );
    }

    #[test]
    fn test_negative_literal_stays_a_target() {
        // The minus sign is a unary operator; the literal below it is still
        // an addressable node.
        let tree = parse("a = -5\n");
        assert_eq!(literals(&tree), vec![LiteralValue::Int(5)]);
    }

    #[test]
    fn test_reject_unparsable_source() {
        assert!(parse_test_source("def broken(:\n").is_err());
    }

    #[test]
    fn test_name_and_call_count() {
        let tree = parse("self.assertEqual(foo(x), y)\n");
        let call = tree
            .ids()
            .find(|id| matches!(tree.kind(*id), NodeKind::Call))
            .unwrap();
        // Outer call + self + inner call + foo + x + y. The attribute name
        // itself is not a Name node.
        assert_eq!(tree.name_and_call_count(call), 6);
    }

    #[test]
    fn test_path_string_rendering() {
        let tree = parse("def test_x(self):\n    self.assertEqual(10, b)\n");
        let lit = tree
            .ids()
            .find(|id| matches!(tree.kind(*id), NodeKind::Literal(LiteralValue::Int(10))))
            .unwrap();
        assert_eq!(
            tree.path_string(lit),
            ".body[0].body[0].value.args[0]"
        );
    }
}
