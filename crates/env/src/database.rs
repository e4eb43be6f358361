use bincode::config::{self, Config};
use bincode::serde::{decode_from_slice, encode_to_vec};
use common::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn bincode_config() -> impl Config {
    config::legacy()
}

/// Where a record's bytes live: small values sit inline in the
/// directory, everything else is a blob reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirEntry {
    Inline(Vec<u8>),
    Blob(u64),
}

/// The record directory of one open database, ordered by key.
///
/// Persisted as a single blob whose id lives in the database's name
/// table slot; reloaded wholesale on open.
#[derive(Debug, Default)]
pub struct DatabaseState {
    pub directory: BTreeMap<Vec<u8>, DirEntry>,
    pub dirty: bool,
}

impl DatabaseState {
    pub fn encode(&self) -> DbResult<Vec<u8>> {
        encode_to_vec(&self.directory, bincode_config())
            .map_err(|e| DbError::IntegrityViolated(format!("encode record directory: {e}")))
    }

    pub fn decode(data: &[u8]) -> DbResult<Self> {
        let (directory, _) = decode_from_slice(data, bincode_config())
            .map_err(|e| DbError::IntegrityViolated(format!("decode record directory: {e}")))?;
        Ok(Self {
            directory,
            dirty: false,
        })
    }

    /// Key at position `slot` in directory order.
    pub fn key_at(&self, slot: usize) -> Option<&[u8]> {
        self.directory.keys().nth(slot).map(|k| k.as_slice())
    }

    /// Position of `key` in directory order.
    pub fn slot_of(&self, key: &[u8]) -> Option<usize> {
        self.directory.keys().position(|k| k.as_slice() == key)
    }
}
