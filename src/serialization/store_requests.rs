use crate::error::ClientError;
use crate::protocol::types::{DerivedPath, StorePath};
use crate::protocol::ProtocolVersion;
use crate::serialization::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tokio::io::AsyncWrite;

pub struct QueryValidPathsRequest<'a> {
    pub paths: &'a BTreeSet<StorePath>,
    pub maybe_substitute: bool,
}

impl Serialize for QueryValidPathsRequest<'_> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        self.paths.serialize(writer, version).await?;
        // The substitute flag only exists from minor 27 on.
        if version.minor >= 27 {
            self.maybe_substitute.serialize(writer, version).await?;
        }
        Ok(())
    }
}

pub struct QuerySubstitutablePathInfosRequest<'a> {
    /// Path to rendered content address, empty when unknown
    pub paths: &'a BTreeMap<StorePath, String>,
}

impl Serialize for QuerySubstitutablePathInfosRequest<'_> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        if version.minor < 22 {
            let bare: BTreeSet<&StorePath> = self.paths.keys().collect();
            (bare.len() as u64).serialize(writer, version).await?;
            for path in bare {
                path.serialize(writer, version).await?;
            }
        } else {
            self.paths.serialize(writer, version).await?;
        }
        Ok(())
    }
}

pub struct AddTextToStoreRequest<'a> {
    pub name: &'a str,
    pub text: &'a [u8],
    pub references: &'a BTreeSet<StorePath>,
}

impl Serialize for AddTextToStoreRequest<'_> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        self.name.serialize(writer, version).await?;
        self.text.serialize(writer, version).await?;
        self.references.serialize(writer, version).await
    }
}

pub struct AddSignaturesRequest<'a> {
    pub path: &'a StorePath,
    pub signatures: &'a [String],
}

impl Serialize for AddSignaturesRequest<'_> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        self.path.serialize(writer, version).await?;
        self.signatures.serialize(writer, version).await
    }
}

pub struct BuildPathsRequest<'a> {
    pub paths: &'a [DerivedPath],
    pub mode: u64,
}

impl Serialize for BuildPathsRequest<'_> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        self.paths.serialize(writer, version).await?;
        self.mode.serialize(writer, version).await
    }
}

pub struct VerifyStoreRequest {
    pub check_contents: bool,
    pub repair: bool,
}

impl Serialize for VerifyStoreRequest {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        self.check_contents.serialize(writer, version).await?;
        self.repair.serialize(writer, version).await
    }
}
