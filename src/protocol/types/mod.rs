pub mod build;
pub mod derivation;
pub mod derived_path;
pub mod gc;
pub mod missing;
pub mod path_info;
pub mod realisation;
pub mod store_path;

pub use build::{BuildMode, BuildResult, BuildStatus, KeyedBuildResult};
pub use derivation::{BasicDerivation, DerivationOutput};
pub use derived_path::{DerivedPath, OutputsSpec};
pub use gc::{GCAction, GCOptions, GCResult};
pub use missing::Missing;
pub use path_info::{KeyedValidPathInfo, SubstitutablePathInfo, ValidPathInfo};
pub use realisation::{DrvOutputId, Realisation};
pub use store_path::StorePath;

/// How file contents are turned into a store object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentAddressMethod {
    /// Plain text with references, hashed as a flat string
    Text,
    /// A single flat file
    Flat,
    /// A NAR serialisation of a file system tree
    Recursive,
}

impl ContentAddressMethod {
    /// Render the method together with a hash algorithm the way the
    /// daemon parses it, e.g. `fixed:r:sha256`.
    pub fn render(&self, algo: HashAlgo) -> String {
        match self {
            Self::Text => format!("text:{}", algo.name()),
            Self::Flat => format!("fixed:{}", algo.name()),
            Self::Recursive => format!("fixed:r:{}", algo.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgo {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}
