//! Per-namespace enable check consulted before any capture work.

use crate::TraceTarget;

/// Read-only view of the target table keyed by PID-namespace inode.
pub trait TargetTable {
    fn lookup(&self, pid_ns_inode: u32) -> Option<TraceTarget>;
}

/// Fail-closed gate: an unknown namespace, a disabled entry, or a
/// namespace that could not be resolved all mean "do not capture".
#[inline(always)]
pub fn is_enabled<T: TargetTable + ?Sized>(targets: &T, pid_ns_inode: Option<u32>) -> bool {
    let Some(inode) = pid_ns_inode else {
        return false;
    };
    match targets.lookup(inode) {
        Some(target) => target.is_enabled(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Table(HashMap<u32, TraceTarget>);

    impl TargetTable for Table {
        fn lookup(&self, pid_ns_inode: u32) -> Option<TraceTarget> {
            self.0.get(&pid_ns_inode).copied()
        }
    }

    #[test]
    fn test_enabled_namespace_passes() {
        let table = Table(HashMap::from([(4026531836, TraceTarget::ENABLED)]));
        assert!(is_enabled(&table, Some(4026531836)));
    }

    #[test]
    fn test_missing_entry_is_closed() {
        let table = Table(HashMap::new());
        assert!(!is_enabled(&table, Some(4026531836)));
    }

    #[test]
    fn test_disabled_entry_is_closed() {
        let table = Table(HashMap::from([(42, TraceTarget::DISABLED)]));
        assert!(!is_enabled(&table, Some(42)));
    }

    #[test]
    fn test_unresolved_namespace_is_closed() {
        let table = Table(HashMap::from([(0, TraceTarget::ENABLED)]));
        assert!(!is_enabled(&table, None));
    }
}
