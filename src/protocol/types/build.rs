use crate::protocol::types::{DerivedPath, Realisation};
use std::collections::BTreeMap;

#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildMode {
    #[default]
    Normal = 0,
    Repair = 1,
    Check = 2,
}

#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Built = 0,
    Substituted = 1,
    AlreadyValid = 2,
    PermanentFailure = 3,
    InputRejected = 4,
    OutputRejected = 5,
    TransientFailure = 6,
    TimedOut = 7,
    MiscFailure = 8,
    DependencyFailed = 9,
    LogLimitExceeded = 10,
    NotDeterministic = 11,
    ResolvesToAlreadyValid = 12,
    NoSubstituters = 13,
}

impl BuildStatus {
    pub fn from_u64(value: u64) -> Option<Self> {
        Some(match value {
            0 => Self::Built,
            1 => Self::Substituted,
            2 => Self::AlreadyValid,
            3 => Self::PermanentFailure,
            4 => Self::InputRejected,
            5 => Self::OutputRejected,
            6 => Self::TransientFailure,
            7 => Self::TimedOut,
            8 => Self::MiscFailure,
            9 => Self::DependencyFailed,
            10 => Self::LogLimitExceeded,
            11 => Self::NotDeterministic,
            12 => Self::ResolvesToAlreadyValid,
            13 => Self::NoSubstituters,
            _ => return None,
        })
    }

    pub fn success(&self) -> bool {
        matches!(
            self,
            Self::Built | Self::Substituted | Self::AlreadyValid | Self::ResolvesToAlreadyValid
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub status: BuildStatus,
    pub error_msg: Option<String>,
    pub times_built: u64,
    pub is_non_deterministic: bool,
    pub start_time: u64,
    pub stop_time: u64,
    /// Output name -> realisation, populated on protocol minor >= 28
    pub built_outputs: BTreeMap<String, Realisation>,
}

impl BuildResult {
    pub fn with_status(status: BuildStatus) -> Self {
        Self {
            status,
            error_msg: None,
            times_built: 0,
            is_non_deterministic: false,
            start_time: 0,
            stop_time: 0,
            built_outputs: BTreeMap::new(),
        }
    }
}

/// A build result together with the derived path it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedBuildResult {
    pub path: DerivedPath,
    pub result: BuildResult,
}
