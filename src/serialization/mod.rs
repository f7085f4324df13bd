pub mod compound;
pub mod primitives;
pub mod store_requests;
pub mod store_types;

use crate::error::ClientError;
use crate::protocol::ProtocolVersion;
use tokio::io::{AsyncRead, AsyncWrite};

/// Zero bytes used to pad strings to the next 8-byte boundary.
pub(crate) const ZEROS: [u8; 8] = [0u8; 8];

pub(crate) const fn padding(len: u64) -> usize {
    (len.wrapping_add(7) & !7).wrapping_sub(len) as usize
}

#[allow(async_fn_in_trait)]
pub trait Serialize {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError>;
}

#[allow(async_fn_in_trait)]
pub trait Deserialize: Sized {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError>;
}
