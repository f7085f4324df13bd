use crate::error::ClientError;
use crate::protocol::types::{
    BasicDerivation, BuildResult, BuildStatus, DerivedPath, DrvOutputId, GCOptions, GCResult,
    KeyedBuildResult, Missing, Realisation, StorePath,
};
use crate::protocol::ProtocolVersion;
use crate::serialization::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::io::{AsyncRead, AsyncWrite};

// Derived paths travel in their rendered string form.
impl Serialize for DerivedPath {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        self.to_string().serialize(writer, version).await
    }
}

impl Deserialize for DerivedPath {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        let s = String::deserialize(reader, version).await?;
        DerivedPath::parse(&s).map_err(ClientError::Malformed)
    }
}

impl Deserialize for DrvOutputId {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        let s = String::deserialize(reader, version).await?;
        DrvOutputId::parse(&s).map_err(ClientError::Malformed)
    }
}

impl Serialize for DrvOutputId {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        self.to_string().serialize(writer, version).await
    }
}

/// JSON shape of a realisation; realisations travel as JSON strings on
/// the wire.
#[derive(serde::Serialize, serde::Deserialize)]
struct RealisationJson {
    id: String,
    #[serde(rename = "outPath")]
    out_path: String,
    #[serde(default)]
    signatures: Vec<String>,
    #[serde(rename = "dependentRealisations", default)]
    dependent_realisations: BTreeMap<String, String>,
}

impl Serialize for Realisation {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        let json = RealisationJson {
            id: self.id.to_string(),
            out_path: self.out_path.to_string(),
            signatures: self.signatures.clone(),
            dependent_realisations: self
                .dependent_realisations
                .iter()
                .map(|(id, path)| (id.to_string(), path.to_string()))
                .collect(),
        };
        let rendered = serde_json::to_string(&json)
            .map_err(|e| ClientError::Malformed(format!("rendering realisation: {e}")))?;
        rendered.serialize(writer, version).await
    }
}

impl Deserialize for Realisation {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        let raw = String::deserialize(reader, version).await?;
        let json: RealisationJson = serde_json::from_str(&raw)
            .map_err(|e| ClientError::Malformed(format!("parsing realisation: {e}")))?;

        let mut dependent_realisations = BTreeMap::new();
        for (id, path) in json.dependent_realisations {
            dependent_realisations.insert(
                DrvOutputId::parse(&id).map_err(ClientError::Malformed)?,
                StorePath::new(path),
            );
        }

        Ok(Realisation {
            id: DrvOutputId::parse(&json.id).map_err(ClientError::Malformed)?,
            out_path: StorePath::new(json.out_path),
            signatures: json.signatures,
            dependent_realisations,
        })
    }
}

impl Deserialize for BuildResult {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        let status_raw = u64::deserialize(reader, version).await?;
        let status = BuildStatus::from_u64(status_raw)
            .ok_or_else(|| ClientError::Malformed(format!("invalid build status {status_raw}")))?;

        let error_msg = {
            let msg = String::deserialize(reader, version).await?;
            if msg.is_empty() { None } else { Some(msg) }
        };

        let mut result = BuildResult::with_status(status);
        result.error_msg = error_msg;

        if version.minor >= 29 {
            result.times_built = u64::deserialize(reader, version).await?;
            result.is_non_deterministic = bool::deserialize(reader, version).await?;
            result.start_time = u64::deserialize(reader, version).await?;
            result.stop_time = u64::deserialize(reader, version).await?;
        }

        if version.minor >= 28 {
            let built: BTreeMap<DrvOutputId, Realisation> =
                BTreeMap::deserialize(reader, version).await?;
            result.built_outputs = built
                .into_iter()
                .map(|(id, realisation)| (id.output_name, realisation))
                .collect();
        }

        Ok(result)
    }
}

impl Deserialize for KeyedBuildResult {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        Ok(KeyedBuildResult {
            path: DerivedPath::deserialize(reader, version).await?,
            result: BuildResult::deserialize(reader, version).await?,
        })
    }
}

impl Serialize for GCOptions {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        (self.action as u64).serialize(writer, version).await?;
        self.paths_to_delete.serialize(writer, version).await?;
        self.ignore_liveness.serialize(writer, version).await?;
        self.max_freed.serialize(writer, version).await?;
        // Three removed options.
        0u64.serialize(writer, version).await?;
        0u64.serialize(writer, version).await?;
        0u64.serialize(writer, version).await?;
        Ok(())
    }
}

impl Deserialize for GCResult {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        let paths = Vec::<String>::deserialize(reader, version).await?;
        let bytes_freed = u64::deserialize(reader, version).await?;
        let _obsolete = u64::deserialize(reader, version).await?;
        Ok(GCResult { paths, bytes_freed })
    }
}

impl Deserialize for Missing {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        Ok(Missing {
            will_build: BTreeSet::deserialize(reader, version).await?,
            will_substitute: BTreeSet::deserialize(reader, version).await?,
            unknown: BTreeSet::deserialize(reader, version).await?,
            download_size: u64::deserialize(reader, version).await?,
            nar_size: u64::deserialize(reader, version).await?,
        })
    }
}

impl Serialize for BasicDerivation {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        (self.outputs.len() as u64).serialize(writer, version).await?;
        for (name, output) in &self.outputs {
            name.serialize(writer, version).await?;
            output.path.serialize(writer, version).await?;
            output.hash_algo.serialize(writer, version).await?;
            output.hash.serialize(writer, version).await?;
        }
        self.input_srcs.serialize(writer, version).await?;
        self.platform.serialize(writer, version).await?;
        self.builder.serialize(writer, version).await?;
        self.args.serialize(writer, version).await?;
        (self.env.len() as u64).serialize(writer, version).await?;
        for (key, value) in &self.env {
            key.serialize(writer, version).await?;
            value.serialize(writer, version).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CLIENT_PROTOCOL_VERSION;
    use std::io::Cursor;

    #[tokio::test]
    async fn realisation_json_round_trip() {
        let realisation = Realisation {
            id: DrvOutputId::parse("sha256:abcdef!out").unwrap(),
            out_path: StorePath::from("/nix/store/xyz-hello"),
            signatures: vec!["cache-1:sig".to_string()],
            dependent_realisations: BTreeMap::from([(
                DrvOutputId::parse("sha256:123456!lib").unwrap(),
                StorePath::from("/nix/store/dep-lib"),
            )]),
        };
        let mut buf = Vec::new();
        realisation
            .serialize(&mut buf, CLIENT_PROTOCOL_VERSION)
            .await
            .unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = Realisation::deserialize(&mut cursor, CLIENT_PROTOCOL_VERSION)
            .await
            .unwrap();
        assert_eq!(realisation, decoded);
    }

    #[tokio::test]
    async fn build_result_gates_on_minor_29() {
        let old = ProtocolVersion { major: 1, minor: 27 };
        let mut buf = Vec::new();
        0u64.serialize(&mut buf, old).await.unwrap(); // status: Built
        "".serialize(&mut buf, old).await.unwrap(); // no error
        let mut cursor = Cursor::new(buf);
        let result = BuildResult::deserialize(&mut cursor, old).await.unwrap();
        assert_eq!(result.status, BuildStatus::Built);
        assert_eq!(result.times_built, 0);
        assert!(result.built_outputs.is_empty());
    }

    #[tokio::test]
    async fn build_result_reads_built_outputs() {
        let v = CLIENT_PROTOCOL_VERSION;
        let mut buf = Vec::new();
        0u64.serialize(&mut buf, v).await.unwrap();
        "".serialize(&mut buf, v).await.unwrap();
        1u64.serialize(&mut buf, v).await.unwrap(); // times_built
        false.serialize(&mut buf, v).await.unwrap();
        100u64.serialize(&mut buf, v).await.unwrap();
        200u64.serialize(&mut buf, v).await.unwrap();
        // one built output
        1u64.serialize(&mut buf, v).await.unwrap();
        "sha256:abc!out".serialize(&mut buf, v).await.unwrap();
        let realisation = Realisation::unsigned(
            DrvOutputId::parse("sha256:abc!out").unwrap(),
            StorePath::from("/nix/store/out"),
        );
        realisation.serialize(&mut buf, v).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let result = BuildResult::deserialize(&mut cursor, v).await.unwrap();
        assert_eq!(result.times_built, 1);
        assert_eq!(
            result.built_outputs["out"].out_path,
            StorePath::from("/nix/store/out")
        );
    }

    #[tokio::test]
    async fn gc_options_carry_three_obsolete_zeros() {
        let opts = GCOptions::delete_dead(4096);
        let mut buf = Vec::new();
        opts.serialize(&mut buf, CLIENT_PROTOCOL_VERSION)
            .await
            .unwrap();
        // action + empty set + ignore_liveness + max_freed + 3 zeros
        assert_eq!(buf.len(), 8 * 7);
        assert_eq!(&buf[buf.len() - 24..], &[0u8; 24]);
    }
}
