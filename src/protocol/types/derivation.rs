use crate::protocol::types::StorePath;
use std::collections::{BTreeMap, BTreeSet};

/// One output of a basic derivation as sent to the daemon.
///
/// For input-addressed outputs only `path` is set; fixed-output
/// derivations also carry the expected hash, rendered as
/// `algo:hex` the way the daemon parses it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DerivationOutput {
    pub path: Option<StorePath>,
    pub hash_algo: String,
    pub hash: String,
}

/// A derivation with all inputs resolved to concrete store paths,
/// ready to be built by the daemon.
///
/// Producing one of these is the evaluator's job; this layer only
/// transports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicDerivation {
    pub outputs: BTreeMap<String, DerivationOutput>,
    pub input_srcs: BTreeSet<StorePath>,
    pub platform: String,
    pub builder: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}
