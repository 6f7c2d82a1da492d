//! Encrypted text pads and contract explorer history, both kept in the
//! account datashard.

use std::sync::Arc;

use crate::datashard::{Datashard, DatashardError};
use crate::Scid;

pub const DATAPADS_TREE: &str = "datapads";
pub const EXPLORER_TREE: &str = "explorer";

/// Longest accepted pad name, in bytes.
pub const MAX_PAD_NAME: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DatapadError {
    #[error(transparent)]
    Datashard(#[from] DatashardError),
    #[error("datapad {0} already exists")]
    Exists(String),
    #[error("datapad {0} does not exist")]
    NotFound(String),
    #[error("invalid datapad name: {0:?}")]
    InvalidName(String),
}

fn check_name(name: &str) -> Result<(), DatapadError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed != name || name.len() > MAX_PAD_NAME {
        return Err(DatapadError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub struct Datapads {
    shard: Arc<Datashard>,
}

impl Datapads {
    pub fn new(shard: Arc<Datashard>) -> Self {
        Datapads { shard }
    }

    /// Create an empty pad.
    pub fn create(&self, name: &str) -> Result<(), DatapadError> {
        check_name(name)?;
        if self.shard.get(DATAPADS_TREE, name)?.is_some() {
            return Err(DatapadError::Exists(name.to_string()));
        }
        self.shard.store_encrypted(DATAPADS_TREE, name, b"")?;
        tracing::debug!(pad = name, "Datapad created");
        Ok(())
    }

    /// Overwrite a pad's text, creating it if needed.
    pub fn save(&self, name: &str, text: &str) -> Result<(), DatapadError> {
        check_name(name)?;
        self.shard
            .store_encrypted(DATAPADS_TREE, name, text.as_bytes())?;
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<String, DatapadError> {
        check_name(name)?;
        self.shard
            .get_encrypted_string(DATAPADS_TREE, name)?
            .ok_or_else(|| DatapadError::NotFound(name.to_string()))
    }

    /// Pad names, sorted. Contents stay sealed.
    pub fn list(&self) -> Result<Vec<String>, DatapadError> {
        Ok(self.shard.keys(DATAPADS_TREE)?)
    }

    pub fn delete(&self, name: &str) -> Result<(), DatapadError> {
        check_name(name)?;
        if self.shard.get(DATAPADS_TREE, name)?.is_none() {
            return Err(DatapadError::NotFound(name.to_string()));
        }
        self.shard.delete(DATAPADS_TREE, name)?;
        self.shard.commit(DATAPADS_TREE)?;
        Ok(())
    }
}

/// Contracts the user has looked at, most recent first.
pub struct ExplorerHistory {
    shard: Arc<Datashard>,
}

impl ExplorerHistory {
    pub fn new(shard: Arc<Datashard>) -> Self {
        ExplorerHistory { shard }
    }

    pub fn add(&self, scid: &Scid) -> Result<(), DatashardError> {
        let seen = crate::unix_now().to_be_bytes();
        self.shard.store(EXPLORER_TREE, &scid.to_hex(), &seen)?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<Scid>, DatashardError> {
        let mut seen: Vec<(u64, Scid)> = self
            .shard
            .entries(EXPLORER_TREE)?
            .into_iter()
            .filter_map(|(key, value)| {
                let scid: Scid = key.parse().ok()?;
                let stamp = u64::from_be_bytes(value.as_slice().try_into().ok()?);
                Some((stamp, scid))
            })
            .collect();
        seen.sort_by(|a, b| b.cmp(a));
        Ok(seen.into_iter().map(|(_, scid)| scid).collect())
    }

    pub fn clear(&self) -> Result<(), DatashardError> {
        self.shard.delete_tree(EXPLORER_TREE)
    }
}
