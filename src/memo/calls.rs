//! Logic keys of called sub-functions.
//!
//! When a memoized function is declared to call other memoized
//! functions, their logic keys become part of its memo URI. The keys
//! appear as explicit `calls-` path segments rather than being folded
//! invisibly into the hash, so a changed sub-function is visible in the
//! URI itself. Sub-functions without a logic key cannot invalidate
//! anything and are omitted.

use crate::constants::CALLS_PREFIX;

use super::FunctionId;

/// One declared callee: its identity and its logic key, if any.
#[derive(Debug, Clone)]
pub struct Callee {
    /// Identity of the called function.
    pub id: FunctionId,
    /// The callee's logic key, if declared.
    pub logic_key: Option<String>,
}

/// Build the sorted `calls-` segments for a set of reachable callees.
pub fn calls_segments(callees: &[Callee]) -> Vec<String> {
    let mut segments: Vec<String> = callees
        .iter()
        .filter_map(|callee| {
            callee
                .logic_key
                .as_ref()
                .map(|key| format!("{CALLS_PREFIX}{}@{key}", callee.id))
        })
        .collect();
    segments.sort();
    segments.dedup();
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callee(module: &str, name: &str, key: Option<&str>) -> Callee {
        Callee {
            id: FunctionId::new(module, name),
            logic_key: key.map(String::from),
        }
    }

    #[test]
    fn test_segments_are_sorted_and_deduped() {
        let callees = vec![
            callee("m", "zeta", Some("v1")),
            callee("m", "alpha", Some("v2")),
            callee("m", "zeta", Some("v1")),
        ];
        assert_eq!(
            calls_segments(&callees),
            vec!["calls-m--alpha@v2", "calls-m--zeta@v1"]
        );
    }

    #[test]
    fn test_keyless_callees_are_omitted() {
        let callees = vec![callee("m", "helper", None)];
        assert!(calls_segments(&callees).is_empty());
    }
}
