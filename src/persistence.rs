//! On-disk formats: the hash→ids artifact and helpers for the file-backed
//! stores.
//!
//! Requires the `persistence` feature flag.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::descriptor::DescriptorElementFactory;
use crate::error::{Error, Result};
use crate::hash::HashCode;
use crate::index::{IndexInner, LshNearestNeighborsIndex};

/// The complete hash-code → member-ids mapping of a nearest-neighbour index,
/// as one serializable blob.
///
/// Loading it back with
/// [`LshNearestNeighborsIndex::load_hash_map`](crate::LshNearestNeighborsIndex::load_hash_map)
/// reconstructs the hash index without re-hashing any descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashToIds {
    pub bit_length: usize,
    pub entries: BTreeMap<HashCode, BTreeSet<String>>,
}

impl HashToIds {
    /// Number of ids across all entries.
    pub fn id_count(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum()
    }

    /// Check that codes share `bit_length`, entries are non-empty and no id
    /// appears under two codes.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for (code, ids) in &self.entries {
            if code.bit_length() != self.bit_length {
                return Err(Error::InvalidConfig(format!(
                    "artifact code {code} has {} bits, expected {}",
                    code.bit_length(),
                    self.bit_length
                )));
            }
            if ids.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "artifact code {code} has no member ids"
                )));
            }
            for id in ids {
                if !seen.insert(id.as_str()) {
                    return Err(Error::InvalidConfig(format!(
                        "id {id} appears under more than one hash code"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serialize to a pretty-printed JSON file.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))?;
        atomic_write(path, json.as_bytes())
    }

    /// Deserialize from a JSON file and validate.
    pub fn load_json(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let artifact: Self =
            serde_json::from_str(&data).map_err(|e| Error::Serialization(e.to_string()))?;
        artifact.validate()?;
        Ok(artifact)
    }

    /// Serialize to a compact bincode file.
    pub fn save_bincode(&self, path: &Path) -> Result<()> {
        let bytes = bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))?;
        atomic_write(path, &bytes)
    }

    /// Deserialize from a bincode file and validate.
    pub fn load_bincode(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let artifact: Self =
            bincode::deserialize(&data).map_err(|e| Error::Serialization(e.to_string()))?;
        artifact.validate()?;
        Ok(artifact)
    }
}

impl LshNearestNeighborsIndex {
    /// Snapshot the hash-code → ids mapping.
    pub fn export_hash_map(&self) -> HashToIds {
        let inner = self.inner.read();
        HashToIds {
            bit_length: self.functor.bit_length(),
            entries: inner.hash2uuids.clone(),
        }
    }

    /// Seed an unbuilt index from an artifact without re-hashing.
    ///
    /// Every id is bound to `(type_label, id)` in `factory`'s store; vectors
    /// are only read when a query needs them.
    pub fn load_hash_map(
        &self,
        artifact: HashToIds,
        factory: &DescriptorElementFactory,
        type_label: &str,
    ) -> Result<()> {
        artifact.validate()?;
        if artifact.bit_length != self.functor.bit_length() {
            return Err(Error::InvalidConfig(format!(
                "artifact holds {}-bit codes, functor produces {} bits",
                artifact.bit_length,
                self.functor.bit_length()
            )));
        }

        let mut staged = IndexInner::empty(&self.config.hash_index)?;
        for (code, ids) in &artifact.entries {
            for id in ids {
                staged.uuid2hash.insert(id.clone(), code.clone());
                staged
                    .descriptors
                    .insert(id.clone(), factory.new_descriptor(type_label, id.as_str()));
            }
        }
        let codes: Vec<HashCode> = artifact.entries.keys().cloned().collect();
        staged.hash_index.build(&codes)?;
        staged.hash2uuids = artifact.entries;
        staged.built = true;

        let mut inner = self.inner.write();
        if inner.built {
            return Err(Error::InvalidState(
                "cannot load a hash map into a built index; reset it first".into(),
            ));
        }
        *inner = staged;
        info!(
            ids = inner.uuid2hash.len(),
            codes = inner.hash2uuids.len(),
            "loaded LSH index from hash map"
        );
        Ok(())
    }
}

/// Write `bytes` to a sibling temp file, then rename over `path`.
///
/// Every call gets its own temp name, so concurrent writers of one key never
/// share a half-written file; the last rename wins.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple()));
    if let Err(e) = std::fs::write(&tmp, bytes) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Turn an arbitrary key into a single safe path component.
///
/// ASCII alphanumerics, `-` and `_` pass through; every other byte becomes
/// `%XX`, so distinct keys never collide.
pub(crate) fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    if out.is_empty() {
        out.push('%');
    }
    out
}
