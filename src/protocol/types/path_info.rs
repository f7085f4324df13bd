use crate::protocol::types::StorePath;
use std::collections::BTreeSet;

/// Metadata of a valid store path, without the path itself.
///
/// The NAR hash and the content address are carried as the daemon's
/// rendered strings; this layer does not interpret them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidPathInfo {
    pub deriver: Option<StorePath>,
    pub nar_hash: String,
    pub references: BTreeSet<StorePath>,
    pub registration_time: u64,
    pub nar_size: u64,
    pub ultimate: bool,
    pub signatures: Vec<String>,
    pub content_address: Option<String>,
}

/// A valid path together with its metadata, as returned by path
/// additions and sent ahead of each NAR in a multi-path transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedValidPathInfo {
    pub path: StorePath,
    pub info: ValidPathInfo,
}

/// Info about a path obtainable from a substituter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstitutablePathInfo {
    pub deriver: Option<StorePath>,
    pub references: BTreeSet<StorePath>,
    pub download_size: u64,
    pub nar_size: u64,
}
