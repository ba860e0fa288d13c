//! Undefined-name analysis for generated Python.
//!
//! A single tree walk collects every binding (function and class names,
//! parameters, imports, assignment targets, loop and `with`/`except`
//! targets) and every identifier read. Names read but never bound and not
//! Python builtins come back sorted; the debugger folds them into its fix
//! brief for name-error diagnoses.

use std::collections::HashSet;

use tree_sitter::Node;

use super::parse_python;

const PYTHON_BUILTINS: &[&str] = &[
    "abs",
    "aiter",
    "all",
    "anext",
    "any",
    "ascii",
    "bin",
    "bool",
    "breakpoint",
    "bytearray",
    "bytes",
    "callable",
    "chr",
    "classmethod",
    "compile",
    "complex",
    "delattr",
    "dict",
    "dir",
    "divmod",
    "enumerate",
    "eval",
    "exec",
    "filter",
    "float",
    "format",
    "frozenset",
    "getattr",
    "globals",
    "hasattr",
    "hash",
    "help",
    "hex",
    "id",
    "input",
    "int",
    "isinstance",
    "issubclass",
    "iter",
    "len",
    "list",
    "locals",
    "map",
    "max",
    "memoryview",
    "min",
    "next",
    "object",
    "oct",
    "open",
    "ord",
    "pow",
    "print",
    "property",
    "range",
    "repr",
    "reversed",
    "round",
    "set",
    "setattr",
    "slice",
    "sorted",
    "staticmethod",
    "str",
    "sum",
    "super",
    "tuple",
    "type",
    "vars",
    "zip",
    "__import__",
    "__name__",
    "__file__",
    "__doc__",
    "self",
    "cls",
    "ArithmeticError",
    "AssertionError",
    "AttributeError",
    "BaseException",
    "BaseExceptionGroup",
    "BlockingIOError",
    "BrokenPipeError",
    "BufferError",
    "ChildProcessError",
    "ConnectionAbortedError",
    "ConnectionError",
    "ConnectionRefusedError",
    "ConnectionResetError",
    "DeprecationWarning",
    "EOFError",
    "Ellipsis",
    "EnvironmentError",
    "Exception",
    "ExceptionGroup",
    "FileExistsError",
    "FileNotFoundError",
    "FloatingPointError",
    "GeneratorExit",
    "IOError",
    "ImportError",
    "IndentationError",
    "IndexError",
    "InterruptedError",
    "IsADirectoryError",
    "KeyError",
    "KeyboardInterrupt",
    "LookupError",
    "MemoryError",
    "ModuleNotFoundError",
    "NameError",
    "NotADirectoryError",
    "NotImplemented",
    "NotImplementedError",
    "OSError",
    "OverflowError",
    "PermissionError",
    "ProcessLookupError",
    "RecursionError",
    "ReferenceError",
    "RuntimeError",
    "RuntimeWarning",
    "StopAsyncIteration",
    "StopIteration",
    "SyntaxError",
    "SystemError",
    "SystemExit",
    "TabError",
    "TimeoutError",
    "TypeError",
    "UnboundLocalError",
    "UnicodeDecodeError",
    "UnicodeEncodeError",
    "UnicodeError",
    "UnicodeTranslateError",
    "UserWarning",
    "ValueError",
    "Warning",
    "ZeroDivisionError",
];

/// Find identifiers that are read but never bound anywhere in the module.
/// Returns a sorted, de-duplicated list. Source that does not parse cleanly
/// yields an empty list; syntax problems are the syntax validator's job.
pub fn find_undefined_names(source: &str) -> Vec<String> {
    let tree = match parse_python(source) {
        Some(tree) => tree,
        None => return Vec::new(),
    };
    if tree.root_node().has_error() {
        return Vec::new();
    }

    let src = source.as_bytes();
    let mut defined: HashSet<String> = PYTHON_BUILTINS.iter().map(|s| s.to_string()).collect();
    let mut used: HashSet<String> = HashSet::new();
    walk(tree.root_node(), src, &mut defined, &mut used);

    let mut undefined: Vec<String> = used.difference(&defined).cloned().collect();
    undefined.sort();
    undefined
}

fn text(node: Node<'_>, src: &[u8]) -> String {
    node.utf8_text(src).unwrap_or_default().to_string()
}

/// Add every identifier under an assignment/loop target to the defined set.
fn collect_target(node: Node<'_>, src: &[u8], defined: &mut HashSet<String>) {
    if node.kind() == "identifier" {
        defined.insert(text(node, src));
        return;
    }
    // Subscript and attribute targets mutate existing objects rather than
    // binding new names; their bases still count as reads in the main walk.
    if matches!(node.kind(), "subscript" | "attribute") {
        return;
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_target(child, src, defined);
    }
}

/// Collect parameter names without treating default values or annotations
/// as bindings.
fn collect_params(node: Node<'_>, src: &[u8], defined: &mut HashSet<String>) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "identifier" => {
                defined.insert(text(child, src));
            }
            "default_parameter" | "typed_default_parameter" => {
                if let Some(name) = child.child_by_field_name("name") {
                    collect_target(name, src, defined);
                }
            }
            "typed_parameter" | "list_splat_pattern" | "dictionary_splat_pattern"
            | "tuple_pattern" => {
                collect_params(child, src, defined);
            }
            _ => {}
        }
    }
}

fn walk(node: Node<'_>, src: &[u8], defined: &mut HashSet<String>, used: &mut HashSet<String>) {
    match node.kind() {
        "function_definition" | "class_definition" => {
            if let Some(name) = node.child_by_field_name("name") {
                defined.insert(text(name, src));
            }
            if let Some(params) = node.child_by_field_name("parameters") {
                collect_params(params, src, defined);
            }
        }
        "lambda" => {
            if let Some(params) = node.child_by_field_name("parameters") {
                collect_params(params, src, defined);
            }
        }
        "import_statement" => {
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                match child.kind() {
                    // `import a.b.c` binds the top-level name `a`.
                    "dotted_name" => {
                        if let Some(first) = child.named_child(0) {
                            defined.insert(text(first, src));
                        }
                    }
                    "aliased_import" => {
                        if let Some(alias) = child.child_by_field_name("alias") {
                            defined.insert(text(alias, src));
                        }
                    }
                    _ => {}
                }
            }
            return;
        }
        "import_from_statement" => {
            let mut cursor = node.walk();
            for child in node.children_by_field_name("name", &mut cursor) {
                match child.kind() {
                    "dotted_name" => {
                        if let Some(first) = child.named_child(0) {
                            defined.insert(text(first, src));
                        }
                    }
                    "aliased_import" => {
                        if let Some(alias) = child.child_by_field_name("alias") {
                            defined.insert(text(alias, src));
                        }
                    }
                    _ => {}
                }
            }
            return;
        }
        "assignment" | "augmented_assignment" => {
            if let Some(left) = node.child_by_field_name("left") {
                collect_target(left, src, defined);
            }
        }
        "named_expression" => {
            if let Some(name) = node.child_by_field_name("name") {
                collect_target(name, src, defined);
            }
        }
        "for_statement" | "for_in_clause" => {
            if let Some(left) = node.child_by_field_name("left") {
                collect_target(left, src, defined);
            }
        }
        "as_pattern" => {
            if let Some(alias) = node.child_by_field_name("alias") {
                collect_target(alias, src, defined);
            }
        }
        "global_statement" | "nonlocal_statement" => {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                if child.kind() == "identifier" {
                    defined.insert(text(child, src));
                }
            }
        }
        "identifier" => {
            if is_read_position(node) {
                used.insert(text(node, src));
            }
            return;
        }
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        walk(child, src, defined, used);
    }
}

/// An identifier counts as a read unless it is an attribute name, a keyword
/// argument name, or an import path component. Identifiers in binding
/// positions also land in the used set, but the binding walk adds them to
/// the defined set so they never surface as undefined.
fn is_read_position(node: Node<'_>) -> bool {
    let parent = match node.parent() {
        Some(p) => p,
        None => return true,
    };
    match parent.kind() {
        "dotted_name" => false,
        "attribute" => parent
            .child_by_field_name("attribute")
            .map(|n| n.id() != node.id())
            .unwrap_or(true),
        "keyword_argument" => parent
            .child_by_field_name("name")
            .map(|n| n.id() != node.id())
            .unwrap_or(true),
        _ => true,
    }
}
