use crate::protocol::types::StorePath;
use std::collections::BTreeSet;

/// Garbage collection action to perform
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GCAction {
    /// Return the set of paths reachable from roots
    ReturnLive = 0,
    /// Return the set of paths not reachable from roots
    ReturnDead = 1,
    /// Delete paths not reachable from roots
    DeleteDead = 2,
    /// Delete specific paths
    DeleteSpecific = 3,
}

/// Options for garbage collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GCOptions {
    pub action: GCAction,

    /// Ignore liveness of the roots (dangerous!)
    pub ignore_liveness: bool,

    /// Specific paths to delete, only used with `DeleteSpecific`
    pub paths_to_delete: BTreeSet<StorePath>,

    /// Stop after freeing this many bytes (0 means no limit)
    pub max_freed: u64,
}

impl GCOptions {
    pub fn return_live() -> Self {
        Self {
            action: GCAction::ReturnLive,
            ignore_liveness: false,
            paths_to_delete: BTreeSet::new(),
            max_freed: 0,
        }
    }

    pub fn return_dead() -> Self {
        Self {
            action: GCAction::ReturnDead,
            ignore_liveness: false,
            paths_to_delete: BTreeSet::new(),
            max_freed: 0,
        }
    }

    pub fn delete_dead(max_freed: u64) -> Self {
        Self {
            action: GCAction::DeleteDead,
            ignore_liveness: false,
            paths_to_delete: BTreeSet::new(),
            max_freed,
        }
    }

    pub fn delete_specific(paths: BTreeSet<StorePath>) -> Self {
        Self {
            action: GCAction::DeleteSpecific,
            ignore_liveness: false,
            paths_to_delete: paths,
            max_freed: 0,
        }
    }
}

/// Result of garbage collection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GCResult {
    /// Deleted paths, or the live/dead set for the query actions
    pub paths: Vec<String>,

    /// Total bytes freed
    pub bytes_freed: u64,
}
