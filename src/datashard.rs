//! Per-account snapshot-versioned store.
//!
//! Each named tree is a sled tree whose keys carry a commit version:
//!
//! ```text
//! key   = u32 BE key_len || key || u64 BE version
//! value = 0x00                     (tombstone)
//!       | 0x01 || bytes            (live value)
//! ```
//!
//! Writes are staged per tree on the handle and become visible to other
//! readers only on `commit`, which writes every staged entry under the next
//! version and bumps the tree's entry in `__versions` inside one sled
//! transaction. A committed version is never rewritten, so a snapshot pinned
//! at version `v` reads the same values for as long as it is held.
//!
//! Superseded versions are reclaimed by `prune`. It keeps everything a held
//! snapshot (or the latest version) can still read and records the oldest
//! surviving version in `__pruned`; older snapshots can no longer be opened.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};

const VERSIONS_TREE: &str = "__versions";
const PRUNED_TREE: &str = "__pruned";
const TREE_PREFIX: &str = "t/";
const TOMBSTONE: u8 = 0x00;
const LIVE: u8 = 0x01;

/// Symmetric envelope applied to wallet-encrypted values.
pub trait ValueCipher: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Vec<u8>;
    /// `None` if the value was sealed under another key or was tampered with.
    fn unseal(&self, sealed: &[u8]) -> Option<Vec<u8>>;
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DatashardError {
    #[error("tree name must not be empty")]
    MissingTree,
    #[error("key must not be empty")]
    MissingKey,
    #[error("no active account for encrypted value")]
    NoActiveAccount,
    #[error("cannot decrypt {tree}/{key}")]
    Decrypt { tree: String, key: String },
    #[error("snapshot {version} of tree {tree} does not exist")]
    SnapshotNotFound { tree: String, version: u64 },
    #[error("datashard I/O error: {0}")]
    Io(String),
    #[error("datashard corrupt: {0}")]
    Corrupt(String),
}

type StagedTree = BTreeMap<String, Option<Vec<u8>>>;

/// Live snapshot counts per tree and version.
type Pins = Arc<Mutex<HashMap<String, BTreeMap<u64, usize>>>>;

/// A datashard handle. Share it behind an `Arc`; sled holds an exclusive
/// lock on the directory.
pub struct Datashard {
    db: sled::Db,
    path: Option<PathBuf>,
    versions: sled::Tree,
    pruned: sled::Tree,
    pending: Mutex<HashMap<String, StagedTree>>,
    pins: Pins,
    cipher: Option<Arc<dyn ValueCipher>>,
}

impl std::fmt::Debug for Datashard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datashard")
            .field("path", &self.path)
            .field("encrypted", &self.cipher.is_some())
            .finish_non_exhaustive()
    }
}

impl Datashard {
    /// Open or create the shard at `path`. Pass the account cipher to enable
    /// encrypted values; the pre-login settings shard has none.
    pub fn open(path: &Path, cipher: Option<Arc<dyn ValueCipher>>) -> Result<Self, DatashardError> {
        std::fs::create_dir_all(path).map_err(|e| DatashardError::Io(e.to_string()))?;
        let db = sled::open(path).map_err(|e| DatashardError::Io(e.to_string()))?;
        Self::from_db(db, Some(path.to_path_buf()), cipher)
    }

    /// In-memory shard (for testing).
    pub fn open_temporary(cipher: Option<Arc<dyn ValueCipher>>) -> Result<Self, DatashardError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| DatashardError::Io(e.to_string()))?;
        Self::from_db(db, None, cipher)
    }

    fn from_db(
        db: sled::Db,
        path: Option<PathBuf>,
        cipher: Option<Arc<dyn ValueCipher>>,
    ) -> Result<Self, DatashardError> {
        let versions = db
            .open_tree(VERSIONS_TREE)
            .map_err(|e| DatashardError::Io(e.to_string()))?;
        let pruned = db
            .open_tree(PRUNED_TREE)
            .map_err(|e| DatashardError::Io(e.to_string()))?;
        Ok(Datashard {
            db,
            path,
            versions,
            pruned,
            pending: Mutex::new(HashMap::new()),
            pins: Arc::new(Mutex::new(HashMap::new())),
            cipher,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn has_cipher(&self) -> bool {
        self.cipher.is_some()
    }

    // ── Plaintext values ──

    /// Stage a value. Visible to this handle immediately, to snapshots after
    /// `commit`.
    pub fn put(&self, tree: &str, key: &str, value: &[u8]) -> Result<(), DatashardError> {
        check_names(tree, key)?;
        self.stage(tree, key, Some(value.to_vec()));
        Ok(())
    }

    /// Stage a deletion. Deleting an absent key is not an error.
    pub fn delete(&self, tree: &str, key: &str) -> Result<(), DatashardError> {
        check_names(tree, key)?;
        self.stage(tree, key, None);
        Ok(())
    }

    /// Read through staged writes, then the latest committed version.
    pub fn get(&self, tree: &str, key: &str) -> Result<Option<Vec<u8>>, DatashardError> {
        check_names(tree, key)?;
        {
            let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(staged) = pending.get(tree).and_then(|t| t.get(key)) {
                return Ok(staged.clone());
            }
        }
        let version = self.version(tree)?;
        read_at(&self.data_tree(tree)?, key, version)
    }

    pub fn get_string(&self, tree: &str, key: &str) -> Result<Option<String>, DatashardError> {
        Ok(self
            .get(tree, key)?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    /// `put` then `commit`.
    pub fn store(&self, tree: &str, key: &str, value: &[u8]) -> Result<u64, DatashardError> {
        self.put(tree, key, value)?;
        self.commit(tree)
    }

    // ── Encrypted values ──

    pub fn put_encrypted(&self, tree: &str, key: &str, value: &[u8]) -> Result<(), DatashardError> {
        let cipher = self.cipher.as_ref().ok_or(DatashardError::NoActiveAccount)?;
        self.put(tree, key, &cipher.seal(value))
    }

    pub fn get_encrypted(&self, tree: &str, key: &str) -> Result<Option<Vec<u8>>, DatashardError> {
        let cipher = self.cipher.as_ref().ok_or(DatashardError::NoActiveAccount)?;
        match self.get(tree, key)? {
            Some(sealed) => cipher
                .unseal(&sealed)
                .map(Some)
                .ok_or_else(|| DatashardError::Decrypt {
                    tree: tree.to_string(),
                    key: key.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub fn get_encrypted_string(
        &self,
        tree: &str,
        key: &str,
    ) -> Result<Option<String>, DatashardError> {
        Ok(self
            .get_encrypted(tree, key)?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    /// `put_encrypted` then `commit`.
    pub fn store_encrypted(&self, tree: &str, key: &str, value: &[u8]) -> Result<u64, DatashardError> {
        self.put_encrypted(tree, key, value)?;
        self.commit(tree)
    }

    // ── Versions ──

    /// Publish the tree's staged writes as a new version. Returns the
    /// committed version; with nothing staged the current version is
    /// returned unchanged.
    pub fn commit(&self, tree: &str) -> Result<u64, DatashardError> {
        if tree.is_empty() {
            return Err(DatashardError::MissingTree);
        }
        let writes = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.remove(tree) {
                Some(writes) if !writes.is_empty() => writes,
                _ => return self.version(tree),
            }
        };
        let data = self.data_tree(tree)?;
        let result: Result<u64, TransactionError<()>> =
            (&data, &self.versions).transaction(|(d, m)| {
                let current = match m.get(tree.as_bytes())? {
                    Some(raw) => decode_version(&raw).unwrap_or(0),
                    None => 0,
                };
                let next = current + 1;
                for (key, value) in writes.iter() {
                    d.insert(data_key(key, next), encode_value(value.as_deref()))?;
                }
                m.insert(tree.as_bytes(), next.to_be_bytes().to_vec())?;
                Ok::<_, ConflictableTransactionError<()>>(next)
            });
        match result {
            Ok(version) => {
                tracing::debug!(tree, version, entries = writes.len(), "Committed datashard tree");
                Ok(version)
            }
            Err(e) => {
                // Put the write set back so a retry can commit it.
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                let staged = pending.entry(tree.to_string()).or_default();
                for (key, value) in writes {
                    staged.entry(key).or_insert(value);
                }
                tracing::error!(tree, error = ?e, "Datashard commit failed");
                Err(DatashardError::Io(format!("{:?}", e)))
            }
        }
    }

    /// Drop the tree's staged writes.
    pub fn discard(&self, tree: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(tree);
    }

    /// Latest committed version of a tree; `0` if never committed.
    pub fn version(&self, tree: &str) -> Result<u64, DatashardError> {
        if tree.is_empty() {
            return Err(DatashardError::MissingTree);
        }
        match self
            .versions
            .get(tree.as_bytes())
            .map_err(|e| DatashardError::Io(e.to_string()))?
        {
            Some(raw) => decode_version(&raw)
                .ok_or_else(|| DatashardError::Corrupt(format!("version of {}", tree))),
            None => Ok(0),
        }
    }

    /// Read-only view pinned at `version`; `0` pins the latest. Versions
    /// below the prune floor are gone.
    pub fn snapshot(&self, tree: &str, version: u64) -> Result<TreeSnapshot, DatashardError> {
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        let latest = self.version(tree)?;
        let pinned = if version == 0 { latest } else { version };
        if pinned > latest || pinned < self.prune_floor(tree)? {
            return Err(DatashardError::SnapshotNotFound {
                tree: tree.to_string(),
                version,
            });
        }
        *pins
            .entry(tree.to_string())
            .or_default()
            .entry(pinned)
            .or_default() += 1;
        drop(pins);
        Ok(TreeSnapshot {
            name: tree.to_string(),
            tree: self.data_tree(tree)?,
            version: pinned,
            _pin: Arc::new(Pin {
                pins: self.pins.clone(),
                tree: tree.to_string(),
                version: pinned,
            }),
        })
    }

    /// Oldest version still readable; `0` if the tree was never pruned.
    pub fn prune_floor(&self, tree: &str) -> Result<u64, DatashardError> {
        match self
            .pruned
            .get(tree.as_bytes())
            .map_err(|e| DatashardError::Io(e.to_string()))?
        {
            Some(raw) => decode_version(&raw)
                .ok_or_else(|| DatashardError::Corrupt(format!("prune floor of {}", tree))),
            None => Ok(0),
        }
    }

    /// Drop entries no reader can reach: for each key, every version older
    /// than the newest one at or below the oldest held snapshot (or the
    /// latest version when none is held). A tombstone left as the oldest
    /// entry goes too. Returns the number of entries removed.
    pub fn prune(&self, tree: &str) -> Result<usize, DatashardError> {
        let floor = {
            let pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
            let latest = self.version(tree)?;
            let oldest_held = pins
                .get(tree)
                .and_then(|held| held.keys().next().copied())
                .unwrap_or(latest);
            let floor = oldest_held.min(latest);
            if floor == 0 {
                return Ok(0);
            }
            if floor > self.prune_floor(tree)? {
                self.pruned
                    .insert(tree.as_bytes(), floor.to_be_bytes().to_vec())
                    .map_err(|e| DatashardError::Io(e.to_string()))?;
            }
            floor
        };

        let data = self.data_tree(tree)?;
        let mut batch = sled::Batch::default();
        let mut removed = 0;
        // Newest entry at or below the floor for the key being walked.
        let mut kept: Option<(String, sled::IVec, bool)> = None;
        for item in data.iter() {
            let (raw_key, raw_value) = item.map_err(|e| DatashardError::Io(e.to_string()))?;
            let (key, v) = split_data_key(&raw_key)
                .ok_or_else(|| DatashardError::Corrupt("malformed data key".into()))?;
            if v > floor {
                continue;
            }
            let tombstone = decode_value(&raw_value)?.is_none();
            if let Some((prev_key, prev_raw, prev_tombstone)) = kept.take() {
                if prev_key == key || prev_tombstone {
                    batch.remove(prev_raw);
                    removed += 1;
                }
            }
            kept = Some((key, raw_key, tombstone));
        }
        if let Some((_, raw, true)) = kept {
            batch.remove(raw);
            removed += 1;
        }
        data.apply_batch(batch)
            .map_err(|e| DatashardError::Io(e.to_string()))?;
        if removed > 0 {
            tracing::debug!(tree, floor, removed, "Pruned datashard tree");
        }
        Ok(removed)
    }

    /// `prune` every committed tree. Returns the number of entries removed.
    pub fn compact(&self) -> Result<usize, DatashardError> {
        let mut trees = Vec::new();
        for item in self.versions.iter() {
            let (name, _) = item.map_err(|e| DatashardError::Io(e.to_string()))?;
            trees.push(String::from_utf8_lossy(&name).into_owned());
        }
        let mut removed = 0;
        for tree in trees {
            removed += self.prune(&tree)?;
        }
        Ok(removed)
    }

    /// Keys of the tree (staged writes included), sorted. Values are not
    /// decrypted.
    pub fn keys(&self, tree: &str) -> Result<Vec<String>, DatashardError> {
        Ok(self.entries(tree)?.into_keys().collect())
    }

    /// Live entries of the tree (staged writes included), sorted by key.
    pub fn entries(&self, tree: &str) -> Result<BTreeMap<String, Vec<u8>>, DatashardError> {
        let version = self.version(tree)?;
        let mut map = scan_at(&self.data_tree(tree)?, version)?;
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(staged) = pending.get(tree) {
            for (key, value) in staged {
                match value {
                    Some(v) => {
                        map.insert(key.clone(), v.clone());
                    }
                    None => {
                        map.remove(key);
                    }
                }
            }
        }
        Ok(map)
    }

    /// Remove a tree and all its versions.
    pub fn delete_tree(&self, tree: &str) -> Result<(), DatashardError> {
        if tree.is_empty() {
            return Err(DatashardError::MissingTree);
        }
        self.discard(tree);
        self.db
            .drop_tree(format!("{}{}", TREE_PREFIX, tree))
            .map_err(|e| DatashardError::Io(e.to_string()))?;
        self.versions
            .remove(tree.as_bytes())
            .map_err(|e| DatashardError::Io(e.to_string()))?;
        self.pruned
            .remove(tree.as_bytes())
            .map_err(|e| DatashardError::Io(e.to_string()))?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), DatashardError> {
        self.db
            .flush()
            .map_err(|e| DatashardError::Io(e.to_string()))?;
        Ok(())
    }

    fn stage(&self, tree: &str, key: &str, value: Option<Vec<u8>>) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending
            .entry(tree.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    fn data_tree(&self, tree: &str) -> Result<sled::Tree, DatashardError> {
        self.db
            .open_tree(format!("{}{}", TREE_PREFIX, tree))
            .map_err(|e| DatashardError::Io(e.to_string()))
    }
}

impl Drop for Datashard {
    fn drop(&mut self) {
        let pending = self.pending.get_mut().unwrap_or_else(|e| e.into_inner());
        let dropped: usize = pending.values().map(|t| t.len()).sum();
        if dropped > 0 {
            tracing::warn!(dropped, "Closing datashard with uncommitted writes");
        }
        if let Err(e) = self.db.flush() {
            tracing::warn!(error = %e, "Datashard flush on close failed");
        }
    }
}

/// Holds a version against `prune` until the last clone of its snapshot
/// is dropped.
struct Pin {
    pins: Pins,
    tree: String,
    version: u64,
}

impl Drop for Pin {
    fn drop(&mut self) {
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(held) = pins.get_mut(&self.tree) {
            if let Some(count) = held.get_mut(&self.version) {
                *count -= 1;
                if *count == 0 {
                    held.remove(&self.version);
                }
            }
            if held.is_empty() {
                pins.remove(&self.tree);
            }
        }
    }
}

/// A tree pinned at a committed version.
#[derive(Clone)]
pub struct TreeSnapshot {
    name: String,
    tree: sled::Tree,
    version: u64,
    _pin: Arc<Pin>,
}

impl TreeSnapshot {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DatashardError> {
        if key.is_empty() {
            return Err(DatashardError::MissingKey);
        }
        read_at(&self.tree, key, self.version)
    }

    pub fn keys(&self) -> Result<Vec<String>, DatashardError> {
        Ok(scan_at(&self.tree, self.version)?.into_keys().collect())
    }

    pub fn entries(&self) -> Result<BTreeMap<String, Vec<u8>>, DatashardError> {
        scan_at(&self.tree, self.version)
    }
}

// ── Encoding ──

fn check_names(tree: &str, key: &str) -> Result<(), DatashardError> {
    if tree.is_empty() {
        return Err(DatashardError::MissingTree);
    }
    if key.is_empty() {
        return Err(DatashardError::MissingKey);
    }
    Ok(())
}

fn key_prefix(key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len() + 8);
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key.as_bytes());
    out
}

fn data_key(key: &str, version: u64) -> Vec<u8> {
    let mut out = key_prefix(key);
    out.extend_from_slice(&version.to_be_bytes());
    out
}

fn split_data_key(raw: &[u8]) -> Option<(String, u64)> {
    if raw.len() < 12 {
        return None;
    }
    let len = u32::from_be_bytes(raw[..4].try_into().ok()?) as usize;
    if raw.len() != 4 + len + 8 {
        return None;
    }
    let key = String::from_utf8(raw[4..4 + len].to_vec()).ok()?;
    let version = u64::from_be_bytes(raw[4 + len..].try_into().ok()?);
    Some((key, version))
}

fn encode_value(value: Option<&[u8]>) -> Vec<u8> {
    match value {
        Some(v) => {
            let mut out = Vec::with_capacity(1 + v.len());
            out.push(LIVE);
            out.extend_from_slice(v);
            out
        }
        None => vec![TOMBSTONE],
    }
}

fn decode_value(raw: &[u8]) -> Result<Option<Vec<u8>>, DatashardError> {
    match raw.first() {
        Some(&LIVE) => Ok(Some(raw[1..].to_vec())),
        Some(&TOMBSTONE) => Ok(None),
        _ => Err(DatashardError::Corrupt("unknown value tag".into())),
    }
}

fn decode_version(raw: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(raw.try_into().ok()?))
}

/// Latest value of `key` at or below `version`.
fn read_at(tree: &sled::Tree, key: &str, version: u64) -> Result<Option<Vec<u8>>, DatashardError> {
    if version == 0 {
        return Ok(None);
    }
    let lo = data_key(key, 0);
    let hi = data_key(key, version);
    match tree.range(lo..=hi).next_back() {
        Some(Ok((_, raw))) => decode_value(&raw),
        Some(Err(e)) => Err(DatashardError::Io(e.to_string())),
        None => Ok(None),
    }
}

/// All live entries at `version`.
fn scan_at(tree: &sled::Tree, version: u64) -> Result<BTreeMap<String, Vec<u8>>, DatashardError> {
    let mut latest: BTreeMap<String, (u64, Option<Vec<u8>>)> = BTreeMap::new();
    if version == 0 {
        return Ok(BTreeMap::new());
    }
    for item in tree.iter() {
        let (raw_key, raw_value) = item.map_err(|e| DatashardError::Io(e.to_string()))?;
        let (key, v) = split_data_key(&raw_key)
            .ok_or_else(|| DatashardError::Corrupt("malformed data key".into()))?;
        if v > version {
            continue;
        }
        let value = decode_value(&raw_value)?;
        match latest.get(&key) {
            Some((seen, _)) if *seen >= v => {}
            _ => {
                latest.insert(key, (v, value));
            }
        }
    }
    Ok(latest
        .into_iter()
        .filter_map(|(k, (_, v))| v.map(|v| (k, v)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct XorCipher(u8);

    impl ValueCipher for XorCipher {
        fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
            let mut out = vec![0xEE];
            out.extend(plaintext.iter().map(|b| b ^ self.0));
            out
        }

        fn unseal(&self, sealed: &[u8]) -> Option<Vec<u8>> {
            match sealed.split_first() {
                Some((0xEE, rest)) => Some(rest.iter().map(|b| b ^ self.0).collect()),
                _ => None,
            }
        }
    }

    fn temp_shard() -> Datashard {
        Datashard::open_temporary(None).unwrap()
    }

    fn encrypted_shard() -> Datashard {
        Datashard::open_temporary(Some(Arc::new(XorCipher(0x5A)))).unwrap()
    }

    #[test]
    fn put_get_delete() {
        let shard = temp_shard();
        shard.put("settings", "endpoint", b"127.0.0.1:10102").unwrap();
        assert_eq!(
            shard.get("settings", "endpoint").unwrap().as_deref(),
            Some(&b"127.0.0.1:10102"[..])
        );
        shard.commit("settings").unwrap();
        shard.delete("settings", "endpoint").unwrap();
        assert_eq!(shard.get("settings", "endpoint").unwrap(), None);
        shard.commit("settings").unwrap();
        assert_eq!(shard.get("settings", "endpoint").unwrap(), None);
        // idempotent
        shard.delete("settings", "endpoint").unwrap();
        shard.commit("settings").unwrap();
    }

    #[test]
    fn empty_names_rejected() {
        let shard = temp_shard();
        assert_eq!(shard.put("", "k", b"v"), Err(DatashardError::MissingTree));
        assert_eq!(shard.put("t", "", b"v"), Err(DatashardError::MissingKey));
        assert_eq!(shard.get("", "k"), Err(DatashardError::MissingTree));
        assert_eq!(shard.commit(""), Err(DatashardError::MissingTree));
    }

    #[test]
    fn commit_bumps_version() {
        let shard = temp_shard();
        assert_eq!(shard.version("pads").unwrap(), 0);
        shard.put("pads", "a", b"1").unwrap();
        assert_eq!(shard.commit("pads").unwrap(), 1);
        // nothing staged
        assert_eq!(shard.commit("pads").unwrap(), 1);
        shard.put("pads", "a", b"2").unwrap();
        assert_eq!(shard.commit("pads").unwrap(), 2);
    }

    #[test]
    fn snapshots_are_immutable() {
        let shard = temp_shard();
        shard.store("pads", "note", b"first").unwrap();
        let v1 = shard.snapshot("pads", 0).unwrap();
        shard.store("pads", "note", b"second").unwrap();
        shard.put("pads", "staged", b"x").unwrap();

        assert_eq!(v1.version(), 1);
        assert_eq!(v1.get("note").unwrap().as_deref(), Some(&b"first"[..]));
        let latest = shard.snapshot("pads", 0).unwrap();
        assert_eq!(latest.get("note").unwrap().as_deref(), Some(&b"second"[..]));
        assert_eq!(latest.get("staged").unwrap(), None);
        assert_eq!(shard.snapshot("pads", 1).unwrap().keys().unwrap(), vec!["note"]);
        assert!(matches!(
            shard.snapshot("pads", 9),
            Err(DatashardError::SnapshotNotFound { .. })
        ));
    }

    #[test]
    fn keys_merge_staged_writes() {
        let shard = temp_shard();
        shard.put("history", "b", b"").unwrap();
        shard.put("history", "a", b"").unwrap();
        shard.commit("history").unwrap();
        shard.put("history", "c", b"").unwrap();
        shard.delete("history", "a").unwrap();
        assert_eq!(shard.keys("history").unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn discard_drops_staged() {
        let shard = temp_shard();
        shard.put("t", "k", b"v").unwrap();
        shard.discard("t");
        assert_eq!(shard.get("t", "k").unwrap(), None);
    }

    #[test]
    fn encryption_requires_cipher() {
        let shard = temp_shard();
        assert_eq!(
            shard.put_encrypted("datapads", "n", b"x"),
            Err(DatashardError::NoActiveAccount)
        );
        assert_eq!(
            shard.get_encrypted("datapads", "n"),
            Err(DatashardError::NoActiveAccount)
        );
    }

    #[test]
    fn encrypted_values_are_opaque_at_rest() {
        let shard = encrypted_shard();
        shard.store_encrypted("datapads", "todo", b"buy milk").unwrap();
        let raw = shard.get("datapads", "todo").unwrap().unwrap();
        assert_ne!(raw, b"buy milk");
        assert_eq!(
            shard.get_encrypted("datapads", "todo").unwrap().as_deref(),
            Some(&b"buy milk"[..])
        );
        shard.store("datapads", "plain", b"not sealed").unwrap();
        assert!(matches!(
            shard.get_encrypted("datapads", "plain"),
            Err(DatashardError::Decrypt { .. })
        ));
    }

    #[test]
    fn delete_tree_removes_versions() {
        let shard = temp_shard();
        shard.store("my_assets", "abc", b"1.00000").unwrap();
        shard.delete_tree("my_assets").unwrap();
        assert_eq!(shard.version("my_assets").unwrap(), 0);
        assert!(shard.keys("my_assets").unwrap().is_empty());
    }

    #[test]
    fn reopen_preserves_committed_only() {
        let dir = tempfile::tempdir().unwrap();
        {
            let shard = Datashard::open(dir.path(), None).unwrap();
            shard.store("settings", "network", b"testnet").unwrap();
            shard.put("settings", "endpoint", b"lost").unwrap();
        }
        let shard = Datashard::open(dir.path(), None).unwrap();
        assert_eq!(
            shard.get_string("settings", "network").unwrap().as_deref(),
            Some("testnet")
        );
        assert_eq!(shard.get("settings", "endpoint").unwrap(), None);
    }

    fn raw_len(shard: &Datashard, tree: &str) -> usize {
        shard.data_tree(tree).unwrap().len()
    }

    #[test]
    fn prune_keeps_held_snapshots() {
        let shard = temp_shard();
        shard.store("pads", "note", b"one").unwrap();
        shard.put("pads", "gone", b"x").unwrap();
        shard.commit("pads").unwrap();
        shard.store("pads", "note", b"two").unwrap();
        let held = shard.snapshot("pads", 3).unwrap();
        shard.store("pads", "note", b"three").unwrap();
        shard.delete("pads", "gone").unwrap();
        shard.commit("pads").unwrap();
        assert_eq!(raw_len(&shard, "pads"), 5);

        // note@1 is shadowed by note@2, which the held snapshot still reads
        assert_eq!(shard.prune("pads").unwrap(), 1);
        assert_eq!(held.get("note").unwrap().as_deref(), Some(&b"two"[..]));
        assert_eq!(held.get("gone").unwrap().as_deref(), Some(&b"x"[..]));
        assert_eq!(shard.get("pads", "note").unwrap().as_deref(), Some(&b"three"[..]));
        assert_eq!(shard.prune_floor("pads").unwrap(), 3);
        assert!(matches!(
            shard.snapshot("pads", 1),
            Err(DatashardError::SnapshotNotFound { .. })
        ));

        let clone = held.clone();
        drop(held);
        assert_eq!(shard.prune("pads").unwrap(), 0);
        drop(clone);
        // note@2 and both entries of the deleted key
        assert_eq!(shard.prune("pads").unwrap(), 3);
        assert_eq!(raw_len(&shard, "pads"), 1);
        assert_eq!(shard.entries("pads").unwrap().len(), 1);
        assert_eq!(shard.get("pads", "gone").unwrap(), None);
        assert!(shard.snapshot("pads", 0).is_ok());
        assert!(shard.snapshot("pads", 3).is_err());
    }

    #[test]
    fn compact_prunes_every_tree() {
        let shard = temp_shard();
        for round in 0..3u8 {
            shard.store("settings", "ring", &[round]).unwrap();
            shard.store("history", "scid", &[round]).unwrap();
        }
        assert_eq!(shard.compact().unwrap(), 4);
        assert_eq!(shard.get("settings", "ring").unwrap().as_deref(), Some(&[2u8][..]));
        assert_eq!(shard.get("history", "scid").unwrap().as_deref(), Some(&[2u8][..]));
        assert_eq!(shard.compact().unwrap(), 0);
    }

    #[test]
    fn key_prefixes_do_not_collide() {
        let shard = temp_shard();
        shard.put("t", "ab", b"1").unwrap();
        shard.put("t", "abc", b"2").unwrap();
        shard.commit("t").unwrap();
        assert_eq!(shard.get("t", "ab").unwrap().as_deref(), Some(&b"1"[..]));
        assert_eq!(shard.get("t", "abc").unwrap().as_deref(), Some(&b"2"[..]));
    }
}
