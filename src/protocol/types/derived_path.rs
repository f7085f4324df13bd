use crate::protocol::types::StorePath;
use std::collections::BTreeSet;
use std::fmt;

/// Specification of which outputs of a derivation to build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputsSpec {
    /// Build all outputs
    All,
    /// Build only the named outputs
    Names(BTreeSet<String>),
}

impl OutputsSpec {
    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Parse from the wire form, e.g. `*` or `out,dev`.
    pub fn parse(s: &str) -> Result<Self, String> {
        if s == "*" {
            Ok(Self::All)
        } else if s.is_empty() {
            Ok(Self::Names(BTreeSet::new()))
        } else {
            Ok(Self::Names(s.split(',').map(str::to_string).collect()))
        }
    }
}

impl fmt::Display for OutputsSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "*"),
            Self::Names(names) => {
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                write!(f, "{}", names.join(","))
            }
        }
    }
}

/// A path that may need to be built or substituted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerivedPath {
    /// A bare store path, hopefully already present
    Opaque(StorePath),
    /// Specific outputs of a derivation
    Built {
        drv: StorePath,
        outputs: OutputsSpec,
    },
}

impl DerivedPath {
    pub fn path(&self) -> &StorePath {
        match self {
            Self::Opaque(path) | Self::Built { drv: path, .. } => path,
        }
    }

    /// Parse from the wire form: `/nix/store/...` or `/nix/store/...!out,dev`.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s.split_once('!') {
            Some((drv, outputs)) => Ok(Self::Built {
                drv: StorePath::from(drv),
                outputs: OutputsSpec::parse(outputs)?,
            }),
            None => Ok(Self::Opaque(StorePath::from(s))),
        }
    }
}

impl fmt::Display for DerivedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opaque(path) => write!(f, "{path}"),
            Self::Built { drv, outputs } => write!(f, "{drv}!{outputs}"),
        }
    }
}
