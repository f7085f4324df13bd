use crate::error::ClientError;
use crate::protocol::messages::{DaemonError, LoggerField, TrustedFlag};
use crate::protocol::types::{KeyedValidPathInfo, StorePath, SubstitutablePathInfo, ValidPathInfo};
use crate::protocol::ProtocolVersion;
use crate::serialization::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::io::{AsyncRead, AsyncWrite};

impl Serialize for StorePath {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        self.as_str().serialize(writer, version).await
    }
}

impl Deserialize for StorePath {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        Ok(StorePath::new(String::deserialize(reader, version).await?))
    }
}

// An optional store path travels as a string, empty meaning absent.
impl Serialize for Option<StorePath> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        match self {
            Some(path) => path.serialize(writer, version).await,
            None => "".serialize(writer, version).await,
        }
    }
}

impl Deserialize for Option<StorePath> {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        let s = String::deserialize(reader, version).await?;
        Ok(if s.is_empty() {
            None
        } else {
            Some(StorePath::new(s))
        })
    }
}

impl Serialize for ValidPathInfo {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        self.deriver.serialize(writer, version).await?;
        self.nar_hash.serialize(writer, version).await?;
        self.references.serialize(writer, version).await?;
        self.registration_time.serialize(writer, version).await?;
        self.nar_size.serialize(writer, version).await?;
        self.ultimate.serialize(writer, version).await?;
        self.signatures.serialize(writer, version).await?;
        match &self.content_address {
            Some(ca) => ca.serialize(writer, version).await?,
            None => "".serialize(writer, version).await?,
        }
        Ok(())
    }
}

impl Deserialize for ValidPathInfo {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        let deriver = Option::<StorePath>::deserialize(reader, version).await?;
        let nar_hash = String::deserialize(reader, version).await?;
        let references = BTreeSet::<StorePath>::deserialize(reader, version).await?;
        let registration_time = u64::deserialize(reader, version).await?;
        let nar_size = u64::deserialize(reader, version).await?;
        let ultimate = bool::deserialize(reader, version).await?;
        let signatures = Vec::<String>::deserialize(reader, version).await?;
        let ca = String::deserialize(reader, version).await?;

        Ok(ValidPathInfo {
            deriver,
            nar_hash,
            references,
            registration_time,
            nar_size,
            ultimate,
            signatures,
            content_address: if ca.is_empty() { None } else { Some(ca) },
        })
    }
}

impl Serialize for KeyedValidPathInfo {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        self.path.serialize(writer, version).await?;
        self.info.serialize(writer, version).await
    }
}

impl Deserialize for KeyedValidPathInfo {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        Ok(KeyedValidPathInfo {
            path: StorePath::deserialize(reader, version).await?,
            info: ValidPathInfo::deserialize(reader, version).await?,
        })
    }
}

impl Deserialize for SubstitutablePathInfo {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        Ok(SubstitutablePathInfo {
            deriver: Option::<StorePath>::deserialize(reader, version).await?,
            references: BTreeSet::<StorePath>::deserialize(reader, version).await?,
            download_size: u64::deserialize(reader, version).await?,
            nar_size: u64::deserialize(reader, version).await?,
        })
    }
}

// The trust flag is a single tag: 0 unknown, 1 trusted, 2 not trusted.
impl Deserialize for Option<TrustedFlag> {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        match u64::deserialize(reader, version).await? {
            0 => Ok(None),
            1 => Ok(Some(TrustedFlag::Trusted)),
            2 => Ok(Some(TrustedFlag::NotTrusted)),
            n => Err(ClientError::Malformed(format!("invalid trust tag {n}"))),
        }
    }
}

impl Serialize for Option<TrustedFlag> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        let tag: u64 = match self {
            None => 0,
            Some(TrustedFlag::Trusted) => 1,
            Some(TrustedFlag::NotTrusted) => 2,
        };
        tag.serialize(writer, version).await
    }
}

impl Deserialize for Vec<LoggerField> {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        let count = u64::deserialize(reader, version).await?;
        let mut fields = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            let field = match u64::deserialize(reader, version).await? {
                0 => LoggerField::Int(u64::deserialize(reader, version).await?),
                1 => LoggerField::String(String::deserialize(reader, version).await?),
                n => {
                    return Err(ClientError::Malformed(format!(
                        "got unsupported logger field type {n:#x}"
                    )))
                }
            };
            fields.push(field);
        }
        Ok(fields)
    }
}

/// Daemons at minor >= 26 send a structured error record; older ones a
/// bare `(message, status)` pair.
impl Deserialize for DaemonError {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        if version.minor >= 26 {
            let typ = String::deserialize(reader, version).await?;
            if typ != "Error" {
                return Err(ClientError::Malformed(format!(
                    "expected error record, got '{typ}'"
                )));
            }
            let level = u64::deserialize(reader, version).await?;
            let name = String::deserialize(reader, version).await?;
            let message = String::deserialize(reader, version).await?;
            let _have_pos = u64::deserialize(reader, version).await?;

            let trace_count = u64::deserialize(reader, version).await?;
            let mut traces = Vec::with_capacity(trace_count.min(64) as usize);
            for _ in 0..trace_count {
                let _have_pos = u64::deserialize(reader, version).await?;
                traces.push(String::deserialize(reader, version).await?);
            }

            Ok(DaemonError {
                level,
                name,
                message,
                traces,
                status: 1,
            })
        } else {
            let message = String::deserialize(reader, version).await?;
            let status = u64::deserialize(reader, version).await?;
            Ok(DaemonError::from_message(message, status))
        }
    }
}
