//! Function identity and logic keys.
//!
//! A function is identified as `<module>--<name>`. Its optional logic
//! key is declared in the function's documentation text on a line
//! containing `function-logic-key: <token>`; changing the token
//! invalidates every previously memoized result for the function
//! without renaming it.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Marker scanned for inside documentation text.
const LOGIC_KEY_MARKER: &str = "function-logic-key:";

/// Stable identity of a registered function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId {
    /// Module path of the function.
    pub module: String,
    /// Function name within the module.
    pub name: String,
}

impl FunctionId {
    /// Create a function id.
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }

    /// Parse the `module--name` rendering.
    pub fn parse(text: &str) -> Option<Self> {
        let (module, name) = text.split_once("--")?;
        if module.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(module, name))
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}--{}", self.module, self.name)
    }
}

/// Render the memo URI path segment for a function: `module--name`,
/// with the logic key appended after `@` when one is declared.
///
/// Keeping the key inside the function segment (rather than as its own
/// path segment) makes parsing unambiguous for keys that themselves
/// contain `--`.
pub fn function_segment(id: &FunctionId, logic_key: Option<&str>) -> String {
    match logic_key {
        Some(key) => format!("{id}@{key}"),
        None => id.to_string(),
    }
}

/// Split a function path segment back into its id and optional logic key.
///
/// The key is everything after the first `@`; function names never
/// contain one.
pub fn parse_function_segment(segment: &str) -> Option<(FunctionId, Option<String>)> {
    match segment.split_once('@') {
        Some((id_part, key)) if !key.is_empty() => Some((FunctionId::parse(id_part)?, Some(key.to_string()))),
        Some((id_part, _)) => Some((FunctionId::parse(id_part)?, None)),
        None => Some((FunctionId::parse(segment)?, None)),
    }
}

/// Extract the logic key from documentation text, if declared.
///
/// The key is the first whitespace-free token after the marker.
pub fn extract_logic_key(doc: &str) -> Option<String> {
    let idx = doc.find(LOGIC_KEY_MARKER)?;
    let after = &doc[idx + LOGIC_KEY_MARKER.len()..];
    let token: String = after.trim_start().chars().take_while(|c| !c.is_whitespace()).collect();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
