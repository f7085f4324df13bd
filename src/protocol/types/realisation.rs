use crate::protocol::types::StorePath;
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of one output of a content-addressed derivation,
/// rendered on the wire as `<drv hash>!<output name>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DrvOutputId {
    pub drv_hash: String,
    pub output_name: String,
}

impl DrvOutputId {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s.split_once('!') {
            Some((drv_hash, output_name)) if !drv_hash.is_empty() && !output_name.is_empty() => {
                Ok(Self {
                    drv_hash: drv_hash.to_string(),
                    output_name: output_name.to_string(),
                })
            }
            _ => Err(format!("invalid derivation output id '{s}'")),
        }
    }
}

impl fmt::Display for DrvOutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.drv_hash, self.output_name)
    }
}

/// Evidence binding a derivation output id to a concrete store path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Realisation {
    pub id: DrvOutputId,
    pub out_path: StorePath,
    pub signatures: Vec<String>,
    pub dependent_realisations: BTreeMap<DrvOutputId, StorePath>,
}

impl Realisation {
    pub fn unsigned(id: DrvOutputId, out_path: StorePath) -> Self {
        Self {
            id,
            out_path,
            signatures: Vec::new(),
            dependent_realisations: BTreeMap::new(),
        }
    }
}
