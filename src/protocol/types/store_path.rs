use std::fmt;

/// An opaque printable identifier of an immutable store object.
///
/// The client never interprets the path; it only transports it as a
/// length-prefixed string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath(String);

impl StorePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for StorePath {
    fn from(path: String) -> Self {
        Self(path)
    }
}

impl From<&str> for StorePath {
    fn from(path: &str) -> Self {
        Self(path.to_string())
    }
}
