//! Client for the Nix daemon worker protocol.
//!
//! Speaks the versioned binary protocol over a Unix domain socket:
//! greeting handshake, per-operation version gates, framed payload
//! streaming, and the interleaved stderr event channel that every
//! request drains before reading its reply.  Connections are pooled,
//! aged out, and poisoned on protocol violations so they are never
//! reused in an undefined state.

pub mod client;
pub mod error;
pub mod framed;
pub mod logger;
pub mod protocol;
pub mod serialization;
pub mod settings;

pub use client::pool::PoolConfig;
pub use client::{ClientMetrics, EvalStore, RemoteStore};
pub use error::ClientError;
pub use logger::{Logger, TracingLogger, Verbosity};
pub use protocol::{ProtocolVersion, CLIENT_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION};
pub use settings::ClientSettings;
