use crate::logger::Verbosity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Settings names that must never appear in the override map sent by
/// `set_options`: the first group is already carried by the fixed
/// preamble, the second is client-side only.
const PREAMBLE_SETTINGS: &[&str] = &[
    "keep-failed",
    "keep-going",
    "fallback",
    "max-jobs",
    "max-silent-time",
    "cores",
    "substitute",
];

const CLIENT_ONLY_SETTINGS: &[&str] = &["show-trace", "experimental-features", "plugin-files"];

/// The build settings a client pushes to the daemon right after the
/// handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub keep_failed: bool,
    pub keep_going: bool,
    pub try_fallback: bool,
    pub verbosity: u64,
    pub max_build_jobs: u64,
    pub max_silent_time: u64,
    pub verbose_build: bool,
    pub build_cores: u64,
    pub use_substitutes: bool,

    /// Remaining settings, pushed as a name/value map.  Names listed in
    /// the fixed preamble and client-only settings are stripped before
    /// sending.
    pub overrides: BTreeMap<String, String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            keep_failed: false,
            keep_going: false,
            try_fallback: false,
            verbosity: Verbosity::Error as u64,
            max_build_jobs: 1,
            max_silent_time: 0,
            verbose_build: true,
            build_cores: 0,
            use_substitutes: true,
            overrides: BTreeMap::new(),
        }
    }
}

impl ClientSettings {
    /// The verbosity the daemon should use for build logs.
    pub fn build_verbosity(&self) -> Verbosity {
        if self.verbose_build {
            Verbosity::Error
        } else {
            Verbosity::Vomit
        }
    }

    /// The override map with preamble and client-only settings removed.
    pub fn filtered_overrides(&self) -> BTreeMap<&str, &str> {
        self.overrides
            .iter()
            .filter(|(name, _)| {
                !PREAMBLE_SETTINGS.contains(&name.as_str())
                    && !CLIENT_ONLY_SETTINGS.contains(&name.as_str())
            })
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect()
    }
}
