//! Encrypted account files, seed words and the per-account value cipher.
//!
//! File layout: `magic(4) || salt(32) || nonce(24) || mac(32) || ciphertext`.
//! The key and MAC key are derived from the password and salt; the body is a
//! bincode `AccountRecord` XORed with a BLAKE3 keystream. Files are written to
//! a temp path, fsynced, restricted to 0600 and renamed into place.
//!
//! Seed phrases are 24 English BIP-39 words encoding the 32-byte secret plus
//! a 25th checksum word picked from the first 24.

use std::path::{Path, PathBuf};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use zeroize::{Zeroize, Zeroizing};

use crate::address::Address;
use crate::config::{AppPaths, Network};
use crate::datashard::ValueCipher;
use crate::{constants, Hash};

const ACCOUNT_FILE_VERSION: u32 = 1;
const ACCOUNT_MAGIC: [u8; 4] = [0x45, 0x4E, 0x47, 0x4B];
const SALT_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;
const MAC_SIZE: usize = 32;
const SEED_WORDS: usize = 24;

/// Seed language index. Only English (`0`) has a word list.
pub const LANGUAGE_ENGLISH: u32 = 0;

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("account already exists: {0}")]
    Exists(PathBuf),
    #[error("account not found: {0}")]
    NotFound(PathBuf),
    #[error("invalid account name: {0:?}")]
    InvalidName(String),
    #[error("wrong password")]
    WrongPassword,
    #[error("account file corrupt: {0}")]
    Corrupt(String),
    #[error("seed: {0}")]
    Seed(String),
    #[error("unsupported seed language: {0}")]
    UnsupportedLanguage(u32),
    #[error("I/O error: {0}")]
    Io(String),
}

#[derive(Serialize, Deserialize)]
struct AccountRecord {
    version: u32,
    network: Network,
    secret: [u8; 32],
    language: u32,
    ring_size: u64,
    scan_window: u64,
    created: u64,
}

impl Drop for AccountRecord {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// An open account. Secret material is wiped on drop.
pub struct KeyStore {
    name: String,
    path: PathBuf,
    network: Network,
    secret: Zeroizing<[u8; 32]>,
    public: [u8; 32],
    language: u32,
    ring_size: u64,
    scan_window: u64,
    created: u64,
    password: Zeroizing<String>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("name", &self.name)
            .field("network", &self.network)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl KeyStore {
    /// Create a new account with a fresh random secret.
    pub fn create(
        paths: &AppPaths,
        network: Network,
        name: &str,
        password: &str,
        language: u32,
    ) -> Result<Self, KeyStoreError> {
        let mut secret = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(secret.as_mut());
        Self::create_with_secret(paths, network, name, password, language, secret)
    }

    /// Recreate an account from its 25-word seed phrase.
    pub fn restore(
        paths: &AppPaths,
        network: Network,
        name: &str,
        password: &str,
        phrase: &str,
    ) -> Result<Self, KeyStoreError> {
        let secret = words_to_secret(phrase)?;
        Self::create_with_secret(paths, network, name, password, LANGUAGE_ENGLISH, secret)
    }

    fn create_with_secret(
        paths: &AppPaths,
        network: Network,
        name: &str,
        password: &str,
        language: u32,
        secret: Zeroizing<[u8; 32]>,
    ) -> Result<Self, KeyStoreError> {
        validate_name(name)?;
        if language != LANGUAGE_ENGLISH {
            return Err(KeyStoreError::UnsupportedLanguage(language));
        }
        let path = paths.wallet_file(network, name);
        if path.exists() {
            return Err(KeyStoreError::Exists(path));
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| KeyStoreError::Io(e.to_string()))?;
        }
        let store = KeyStore {
            name: name.to_string(),
            path,
            network,
            public: derive_public(&secret),
            secret,
            language,
            ring_size: constants::DEFAULT_RING_SIZE,
            scan_window: 0,
            created: crate::unix_now(),
            password: Zeroizing::new(password.to_string()),
        };
        store.save()?;
        tracing::info!(account = %store.name, network = %network, "Created account");
        Ok(store)
    }

    /// Open an existing account file.
    pub fn open(
        paths: &AppPaths,
        network: Network,
        name: &str,
        password: &str,
    ) -> Result<Self, KeyStoreError> {
        validate_name(name)?;
        let path = paths.wallet_file(network, name);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeyStoreError::NotFound(path))
            }
            Err(e) => return Err(KeyStoreError::Io(e.to_string())),
        };
        let record = decrypt_record(&raw, password)?;
        if record.version != ACCOUNT_FILE_VERSION {
            return Err(KeyStoreError::Corrupt(format!(
                "unsupported version {}",
                record.version
            )));
        }
        let secret = Zeroizing::new(record.secret);
        Ok(KeyStore {
            name: name.to_string(),
            path,
            network: record.network,
            public: derive_public(&secret),
            secret,
            language: record.language,
            ring_size: record.ring_size,
            scan_window: record.scan_window,
            created: record.created,
            password: Zeroizing::new(password.to_string()),
        })
    }

    /// Names of the account files in the network's wallet directory, sorted.
    pub fn list(paths: &AppPaths, network: Network) -> Vec<String> {
        let dir = paths.wallet_dir(network);
        let mut names: Vec<String> = match std::fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter_map(|e| {
                    let path = e.path();
                    if path.extension().and_then(|x| x.to_str()) != Some("db") {
                        return None;
                    }
                    path.file_stem()
                        .and_then(|s| s.to_str())
                        .map(|s| s.to_string())
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    pub fn exists(paths: &AppPaths, network: Network, name: &str) -> bool {
        paths.wallet_file(network, name).exists()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn language(&self) -> u32 {
        self.language
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    pub fn address(&self) -> Address {
        Address::new(self.network, self.public)
    }

    /// Secret spend key handed to the wallet library.
    pub fn secret_key(&self) -> &[u8; 32] {
        &self.secret
    }

    /// Hex SHA-1 of the account address, naming the account's datashard.
    pub fn shard_id(&self) -> String {
        shard_id_for(&self.address())
    }

    /// 25-word seed phrase.
    pub fn seed_words(&self) -> Result<Vec<String>, KeyStoreError> {
        secret_to_words(&self.secret)
    }

    pub fn ring_size(&self) -> u64 {
        self.ring_size
    }

    pub fn set_ring_size(&mut self, ring_size: u64) -> Result<(), KeyStoreError> {
        self.ring_size = ring_size;
        self.save()
    }

    /// Recent-block scan window; `0` scans the whole chain.
    pub fn scan_window(&self) -> u64 {
        self.scan_window
    }

    pub fn set_scan_window(&mut self, blocks: u64) -> Result<(), KeyStoreError> {
        self.scan_window = blocks;
        self.save()
    }

    pub fn check_password(&self, password: &str) -> bool {
        crate::constant_time_eq(password.as_bytes(), self.password.as_bytes())
    }

    /// Re-encrypt the account file under a new password.
    pub fn change_password(&mut self, old: &str, new: &str) -> Result<(), KeyStoreError> {
        if !self.check_password(old) {
            return Err(KeyStoreError::WrongPassword);
        }
        self.password = Zeroizing::new(new.to_string());
        self.save()?;
        tracing::info!(account = %self.name, "Changed account password");
        Ok(())
    }

    /// Cipher for wallet-encrypted datashard values.
    pub fn value_cipher(&self) -> AccountCipher {
        AccountCipher {
            key: Zeroizing::new(crate::hash_domain(
                b"engram.datashard.value",
                self.secret.as_ref(),
            )),
        }
    }

    /// Release the account. Secrets are wiped as the store drops.
    pub fn close(self) {
        tracing::debug!(account = %self.name, "Closed account");
    }

    fn save(&self) -> Result<(), KeyStoreError> {
        let record = AccountRecord {
            version: ACCOUNT_FILE_VERSION,
            network: self.network,
            secret: *self.secret,
            language: self.language,
            ring_size: self.ring_size,
            scan_window: self.scan_window,
            created: self.created,
        };
        let plaintext = Zeroizing::new(
            crate::serialize(&record).map_err(|e| KeyStoreError::Corrupt(e.to_string()))?,
        );
        let bytes = encrypt_record(&plaintext, &self.password);
        write_atomic(&self.path, &bytes)
    }
}

/// Hex SHA-1 of an address string.
pub fn shard_id_for(address: &Address) -> String {
    let mut hasher = Sha1::new();
    hasher.update(address.base().to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn validate_name(name: &str) -> Result<(), KeyStoreError> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
        || name.len() > 128;
    if bad {
        return Err(KeyStoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn derive_public(secret: &[u8; 32]) -> [u8; 32] {
    crate::hash_domain(b"engram.account.public", secret)
}

// ── Seed words ──

fn secret_to_words(secret: &[u8; 32]) -> Result<Vec<String>, KeyStoreError> {
    let mnemonic = bip39::Mnemonic::from_entropy_in(bip39::Language::English, secret)
        .map_err(|e| KeyStoreError::Seed(e.to_string()))?;
    let mut words: Vec<String> = mnemonic
        .to_string()
        .split_whitespace()
        .map(|w| w.to_string())
        .collect();
    let check = checksum_word(&words);
    words.push(check);
    Ok(words)
}

fn checksum_word(words: &[String]) -> String {
    let joined = words.join(" ");
    let digest = blake3::hash(joined.as_bytes());
    let idx = u16::from_le_bytes([digest.as_bytes()[0], digest.as_bytes()[1]]) as usize;
    words[idx % words.len()].clone()
}

fn words_to_secret(phrase: &str) -> Result<Zeroizing<[u8; 32]>, KeyStoreError> {
    let words: Vec<String> = phrase
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();
    if words.len() != SEED_WORDS + 1 {
        return Err(KeyStoreError::Seed(format!(
            "expected {} words, got {}",
            SEED_WORDS + 1,
            words.len()
        )));
    }
    let (body, check) = words.split_at(SEED_WORDS);
    if checksum_word(body) != check[0] {
        return Err(KeyStoreError::Seed("checksum word mismatch".into()));
    }
    let mnemonic = bip39::Mnemonic::parse_in_normalized(bip39::Language::English, &body.join(" "))
        .map_err(|e| KeyStoreError::Seed(e.to_string()))?;
    let mut entropy = mnemonic.to_entropy();
    let secret: [u8; 32] = entropy
        .as_slice()
        .try_into()
        .map_err(|_| KeyStoreError::Seed("seed does not encode 32 bytes".into()))?;
    entropy.zeroize();
    Ok(Zeroizing::new(secret))
}

// ── File encryption ──

fn derive_key(domain: &[u8], password: &str, salt: &[u8; SALT_SIZE]) -> Zeroizing<[u8; 32]> {
    let mut input = Zeroizing::new(Vec::with_capacity(salt.len() + password.len()));
    input.extend_from_slice(salt);
    input.extend_from_slice(password.as_bytes());
    Zeroizing::new(crate::hash_domain(domain, &input))
}

pub(crate) fn keystream_xor(
    domain: &[u8],
    key: &[u8; 32],
    nonce: &[u8; NONCE_SIZE],
    data: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut block_input = [0u8; 32 + NONCE_SIZE + 8];
    block_input[..32].copy_from_slice(key);
    block_input[32..32 + NONCE_SIZE].copy_from_slice(nonce);
    for (block_idx, chunk) in data.chunks(32).enumerate() {
        block_input[32 + NONCE_SIZE..].copy_from_slice(&(block_idx as u64).to_le_bytes());
        let block = crate::hash_domain(domain, &block_input);
        out.extend(chunk.iter().zip(block.iter()).map(|(d, k)| d ^ k));
    }
    block_input.zeroize();
    out
}

fn mac(key: &[u8; 32], nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(nonce);
    hasher.update(ciphertext);
    *hasher.finalize().as_bytes()
}

fn encrypt_record(plaintext: &[u8], password: &str) -> Vec<u8> {
    let salt: [u8; SALT_SIZE] = rand::random();
    let nonce: [u8; NONCE_SIZE] = rand::random();
    let enc_key = derive_key(b"engram.keystore.key", password, &salt);
    let mac_key = derive_key(b"engram.keystore.mac", password, &salt);
    let ciphertext = keystream_xor(b"engram.keystore.stream", &enc_key, &nonce, plaintext);
    let tag = mac(&mac_key, &nonce, &ciphertext);
    let mut out = Vec::with_capacity(4 + SALT_SIZE + NONCE_SIZE + MAC_SIZE + ciphertext.len());
    out.extend_from_slice(&ACCOUNT_MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&ciphertext);
    out
}

fn decrypt_record(raw: &[u8], password: &str) -> Result<AccountRecord, KeyStoreError> {
    let header = 4 + SALT_SIZE + NONCE_SIZE + MAC_SIZE;
    if raw.len() < header || raw[..4] != ACCOUNT_MAGIC {
        return Err(KeyStoreError::Corrupt("bad header".into()));
    }
    let salt: [u8; SALT_SIZE] = raw[4..4 + SALT_SIZE]
        .try_into()
        .map_err(|_| KeyStoreError::Corrupt("truncated salt".into()))?;
    let nonce: [u8; NONCE_SIZE] = raw[4 + SALT_SIZE..4 + SALT_SIZE + NONCE_SIZE]
        .try_into()
        .map_err(|_| KeyStoreError::Corrupt("truncated nonce".into()))?;
    let stored_mac = &raw[4 + SALT_SIZE + NONCE_SIZE..header];
    let ciphertext = &raw[header..];

    let mac_key = derive_key(b"engram.keystore.mac", password, &salt);
    if !crate::constant_time_eq(&mac(&mac_key, &nonce, ciphertext), stored_mac) {
        return Err(KeyStoreError::WrongPassword);
    }
    let enc_key = derive_key(b"engram.keystore.key", password, &salt);
    let plaintext = Zeroizing::new(keystream_xor(
        b"engram.keystore.stream",
        &enc_key,
        &nonce,
        ciphertext,
    ));
    crate::deserialize(&plaintext).map_err(|e| KeyStoreError::Corrupt(e.to_string()))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), KeyStoreError> {
    let tmp_path = path.with_extension("db.tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)
            .map_err(|e| KeyStoreError::Io(format!("create failed: {}", e)))?;
        std::io::Write::write_all(&mut file, bytes)
            .map_err(|e| KeyStoreError::Io(format!("write failed: {}", e)))?;
        file.sync_all()
            .map_err(|e| KeyStoreError::Io(format!("fsync failed: {}", e)))?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| KeyStoreError::Io(format!("chmod failed: {}", e)))?;
    }
    std::fs::rename(&tmp_path, path)
        .map_err(|e| KeyStoreError::Io(format!("rename failed: {}", e)))?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

// ── Value cipher ──

/// Seals datashard values with a key derived from the account secret.
///
/// Sealed form: `nonce(24) || mac(32) || ciphertext`.
pub struct AccountCipher {
    key: Zeroizing<[u8; 32]>,
}

impl AccountCipher {
    fn subkey(&self, domain: &[u8]) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(crate::hash_domain(domain, self.key.as_ref()))
    }
}

impl ValueCipher for AccountCipher {
    fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let nonce: [u8; NONCE_SIZE] = rand::random();
        let ciphertext = keystream_xor(
            b"engram.value.stream",
            &self.subkey(b"engram.value.key"),
            &nonce,
            plaintext,
        );
        let tag = mac(&self.subkey(b"engram.value.mac"), &nonce, &ciphertext);
        let mut out = Vec::with_capacity(NONCE_SIZE + MAC_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&ciphertext);
        out
    }

    fn unseal(&self, sealed: &[u8]) -> Option<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + MAC_SIZE {
            return None;
        }
        let nonce: [u8; NONCE_SIZE] = sealed[..NONCE_SIZE].try_into().ok()?;
        let stored_mac = &sealed[NONCE_SIZE..NONCE_SIZE + MAC_SIZE];
        let ciphertext = &sealed[NONCE_SIZE + MAC_SIZE..];
        let expected = mac(&self.subkey(b"engram.value.mac"), &nonce, ciphertext);
        if !crate::constant_time_eq(&expected, stored_mac) {
            return None;
        }
        Some(keystream_xor(
            b"engram.value.stream",
            &self.subkey(b"engram.value.key"),
            &nonce,
            ciphertext,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> (tempfile::TempDir, AppPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::new(dir.path());
        (dir, paths)
    }

    #[test]
    fn create_open_roundtrip() {
        let (_dir, paths) = paths();
        let created = KeyStore::create(&paths, Network::Testnet, "alice", "hunter2", 0).unwrap();
        let opened = KeyStore::open(&paths, Network::Testnet, "alice", "hunter2").unwrap();
        assert_eq!(created.address(), opened.address());
        assert_eq!(opened.ring_size(), constants::DEFAULT_RING_SIZE);
        assert_eq!(opened.network(), Network::Testnet);
    }

    #[test]
    fn wrong_password_rejected() {
        let (_dir, paths) = paths();
        KeyStore::create(&paths, Network::Mainnet, "alice", "hunter2", 0).unwrap();
        assert!(matches!(
            KeyStore::open(&paths, Network::Mainnet, "alice", "nope"),
            Err(KeyStoreError::WrongPassword)
        ));
    }

    #[test]
    fn duplicate_and_missing_accounts() {
        let (_dir, paths) = paths();
        KeyStore::create(&paths, Network::Mainnet, "alice", "pw", 0).unwrap();
        assert!(matches!(
            KeyStore::create(&paths, Network::Mainnet, "alice", "pw", 0),
            Err(KeyStoreError::Exists(_))
        ));
        assert!(matches!(
            KeyStore::open(&paths, Network::Mainnet, "bob", "pw"),
            Err(KeyStoreError::NotFound(_))
        ));
        assert!(matches!(
            KeyStore::create(&paths, Network::Mainnet, "../evil", "pw", 0),
            Err(KeyStoreError::InvalidName(_))
        ));
        assert!(matches!(
            KeyStore::create(&paths, Network::Mainnet, "carol", "pw", 3),
            Err(KeyStoreError::UnsupportedLanguage(3))
        ));
    }

    #[test]
    fn seed_has_25_words_and_restores() {
        let (_dir, paths) = paths();
        let alice = KeyStore::create(&paths, Network::Mainnet, "alice", "pw", 0).unwrap();
        let words = alice.seed_words().unwrap();
        assert_eq!(words.len(), 25);
        let restored =
            KeyStore::restore(&paths, Network::Mainnet, "alice2", "pw", &words.join(" ")).unwrap();
        assert_eq!(restored.address(), alice.address());
        assert_eq!(restored.shard_id(), alice.shard_id());
    }

    #[test]
    fn restore_rejects_bad_checksum_word() {
        let (_dir, paths) = paths();
        let alice = KeyStore::create(&paths, Network::Mainnet, "alice", "pw", 0).unwrap();
        let mut words = alice.seed_words().unwrap();
        let last = words.len() - 1;
        words[last] = if words[last] == "zoo" { "abandon" } else { "zoo" }.to_string();
        assert!(matches!(
            KeyStore::restore(&paths, Network::Mainnet, "x", "pw", &words.join(" ")),
            Err(KeyStoreError::Seed(_))
        ));
        assert!(matches!(
            KeyStore::restore(&paths, Network::Mainnet, "y", "pw", "abandon abandon"),
            Err(KeyStoreError::Seed(_))
        ));
    }

    #[test]
    fn change_password_reencrypts() {
        let (_dir, paths) = paths();
        let mut alice = KeyStore::create(&paths, Network::Mainnet, "alice", "old", 0).unwrap();
        assert!(matches!(
            alice.change_password("wrong", "new"),
            Err(KeyStoreError::WrongPassword)
        ));
        alice.change_password("old", "new").unwrap();
        assert!(KeyStore::open(&paths, Network::Mainnet, "alice", "old").is_err());
        assert!(KeyStore::open(&paths, Network::Mainnet, "alice", "new").is_ok());
    }

    #[test]
    fn preferences_persist() {
        let (_dir, paths) = paths();
        let mut alice = KeyStore::create(&paths, Network::Mainnet, "alice", "pw", 0).unwrap();
        alice.set_ring_size(32).unwrap();
        alice.set_scan_window(500).unwrap();
        let reopened = KeyStore::open(&paths, Network::Mainnet, "alice", "pw").unwrap();
        assert_eq!(reopened.ring_size(), 32);
        assert_eq!(reopened.scan_window(), 500);
    }

    #[test]
    fn list_accounts_sorted() {
        let (_dir, paths) = paths();
        KeyStore::create(&paths, Network::Testnet, "zed", "pw", 0).unwrap();
        KeyStore::create(&paths, Network::Testnet, "amy", "pw", 0).unwrap();
        assert_eq!(KeyStore::list(&paths, Network::Testnet), vec!["amy", "zed"]);
        assert!(KeyStore::list(&paths, Network::Mainnet).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn account_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, paths) = paths();
        let alice = KeyStore::create(&paths, Network::Mainnet, "alice", "pw", 0).unwrap();
        let mode = std::fs::metadata(alice.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn value_cipher_roundtrip_and_tamper() {
        let (_dir, paths) = paths();
        let alice = KeyStore::create(&paths, Network::Mainnet, "alice", "pw", 0).unwrap();
        let cipher = alice.value_cipher();
        let sealed = cipher.seal(b"secret note");
        assert_eq!(cipher.unseal(&sealed).unwrap(), b"secret note");
        let mut tampered = sealed.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        assert!(cipher.unseal(&tampered).is_none());

        let bob = KeyStore::create(&paths, Network::Mainnet, "bob", "pw", 0).unwrap();
        assert!(bob.value_cipher().unseal(&sealed).is_none());
    }

    #[test]
    fn shard_id_is_sha1_hex() {
        let (_dir, paths) = paths();
        let alice = KeyStore::create(&paths, Network::Mainnet, "alice", "pw", 0).unwrap();
        let id = alice.shard_id();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
