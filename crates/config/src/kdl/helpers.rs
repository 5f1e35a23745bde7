//! Small accessors over KDL nodes.
//!
//! Settings are written as child nodes with a single argument
//! (`max-attempts 3`), so every lookup goes through the node's children.

use ::kdl::{KdlNode, KdlValue};

/// First positional argument of a node
pub fn get_first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|entry| entry.name().is_none())
        .map(|entry| entry.value())
}

/// Value of the child node named `key`
pub fn get_child_value<'a>(node: &'a KdlNode, key: &str) -> Option<&'a KdlValue> {
    node.children()?
        .nodes()
        .iter()
        .find(|child| child.name().value() == key)
        .and_then(get_first_arg)
}

pub fn get_string_entry(node: &KdlNode, key: &str) -> Option<String> {
    get_child_value(node, key)
        .and_then(|v| v.as_string())
        .map(str::to_string)
}

pub fn get_int_entry(node: &KdlNode, key: &str) -> Option<i128> {
    get_child_value(node, key).and_then(|v| v.as_integer())
}

/// Names of the child nodes, in document order
pub fn child_names(node: &KdlNode) -> Vec<&str> {
    node.children()
        .map(|doc| doc.nodes().iter().map(|n| n.name().value()).collect())
        .unwrap_or_default()
}
