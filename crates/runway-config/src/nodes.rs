//! Helpers for extracting values from KDL nodes.

use kdl::{KdlNode, KdlValue};

use crate::{ConfigError, ConfigResult};

pub fn get_first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

pub fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    get_first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

/// A string property; present with another type is an error.
pub fn get_string_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<String>> {
    match node.get(name) {
        None => Ok(None),
        Some(v) => v
            .as_string()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| ConfigError::invalid(name, "expected a string")),
    }
}

pub fn get_bool_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<bool>> {
    match node.get(name) {
        None => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| ConfigError::invalid(name, "expected #true or #false")),
    }
}

pub fn get_int_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<i128>> {
    match node.get(name) {
        None => Ok(None),
        Some(v) => v
            .as_integer()
            .map(Some)
            .ok_or_else(|| ConfigError::invalid(name, "expected an integer")),
    }
}

/// All values of a repeatable string property (`needs="a" needs="b"`), or
/// the arguments of a child node with the same name (`needs "a" "b"`).
pub fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let result: Vec<String> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_some_and(|n| n.value() == name))
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect();

    if !result.is_empty() {
        return result;
    }

    node.children()
        .and_then(|children| children.nodes().iter().find(|c| c.name().value() == name))
        .map(get_all_string_args)
        .unwrap_or_default()
}
