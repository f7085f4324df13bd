use crate::protocol::messages::DaemonError;
use crate::protocol::types::{DrvOutputId, StorePath};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid magic number: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },

    #[error(
        "Protocol version mismatch: daemon version {daemon} is incompatible with client range {min}-{max}"
    )]
    IncompatibleVersion {
        daemon: crate::protocol::ProtocolVersion,
        min: crate::protocol::ProtocolVersion,
        max: crate::protocol::ProtocolVersion,
    },

    #[error("String too long: {length} exceeds maximum {max}")]
    StringTooLong { length: u64, max: u64 },

    #[error("String list too long: {length} exceeds maximum {max}")]
    StringListTooLong { length: u64, max: u64 },

    #[error("Invalid operation code: {0}")]
    InvalidOpCode(u64),

    #[error("Got unknown message type {0:#x} from Nix daemon")]
    InvalidMsgCode(u64),

    #[error("Daemon sent data but no sink was provided")]
    MissingSink,

    #[error("Daemon requested data but no source was provided")]
    MissingSource,

    #[error("Malformed data from daemon: {0}")]
    Malformed(String),

    #[error("{0}")]
    Remote(DaemonError),

    #[error("Framed stream aborted after remote error")]
    Aborted,

    #[error("Operation '{feature}' is not supported by daemon protocol version {version}")]
    Unsupported {
        feature: &'static str,
        version: crate::protocol::ProtocolVersion,
    },

    #[error("Cannot find realisation for '{0}'")]
    MissingRealisation(DrvOutputId),

    #[error("{0}")]
    Unimplemented(String),

    #[error("Path '{0}' is not valid")]
    InvalidPath(StorePath),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Pool timeout waiting for available connection")]
    PoolTimeout,

    #[error("Opening a connection to remote store '{uri}' previously failed")]
    StoreUnavailable { uri: String },

    #[error("Cannot open connection to remote store '{uri}': {source}")]
    OpenConnection {
        uri: String,
        #[source]
        source: Box<ClientError>,
    },
}

impl ClientError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this error leaves the connection in an unusable state.
    ///
    /// A remote error arrives in-band via the stderr stream, so the
    /// connection is still in sync afterwards and may be reused.  Anything
    /// that desynchronises the byte stream (transport failure, malformed
    /// or unexpected bytes) poisons the connection.
    pub fn poisons(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::InvalidMagic { .. }
                | Self::IncompatibleVersion { .. }
                | Self::StringTooLong { .. }
                | Self::StringListTooLong { .. }
                | Self::InvalidOpCode(_)
                | Self::InvalidMsgCode(_)
                | Self::MissingSink
                | Self::MissingSource
                | Self::Malformed(_)
                | Self::Aborted
        )
    }

    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::BrokenPipe)
    }

    pub fn is_end_of_file(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Extension trait for adding context to IO errors
pub trait IoErrorContext<T> {
    fn io_context(self, context: impl Into<String>) -> Result<T, ClientError>;
}

impl<T> IoErrorContext<T> for Result<T, std::io::Error> {
    fn io_context(self, context: impl Into<String>) -> Result<T, ClientError> {
        self.map_err(|e| ClientError::io(context, e))
    }
}

impl<T> IoErrorContext<T> for Result<T, ClientError> {
    fn io_context(self, context: impl Into<String>) -> Result<T, ClientError> {
        self.map_err(|e| match e {
            ClientError::Io {
                source,
                context: inner_context,
            } => ClientError::Io {
                context: format!("{}: {}", context.into(), inner_context),
                source,
            },
            other => other,
        })
    }
}
