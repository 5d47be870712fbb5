//! Persistent registry of rotating data keys.
//!
//! The registry file is self-authenticating:
//!
//! ```text
//! [0..16)            registry_iv
//! [16..16+|sanity|)  sanity text, XOR-wrapped under the storage key
//! then repeated:     [len: u32 BE][crc32c: u32 BE][marshaled DataKey]
//! ```
//!
//! The sanity block proves a supplied storage key is the one the registry
//! was created with, without exposing any data key. Data-key material is
//! XOR-wrapped under `(storage_key, DataKey.iv)` at rest. The file is only
//! ever appended to after open; structural rewrites go through a temp file
//! and an atomic rename.

use crate::config::Config;
use crate::crypto::{self, IV_SIZE};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;
use zeroize::Zeroize;

/// File name of the key registry.
pub const KEY_REGISTRY_FILE: &str = "KEYREGISTRY";
/// File name the registry is rewritten through before the atomic rename.
pub const KEY_REGISTRY_REWRITE_FILE: &str = "REWRITE-KEYREGISTRY";

const SANITY_TEXT: &[u8] = b"!VeilDB!Registry!";

/// Smallest valid marshaled data key: id (8) + created_at (8) + iv (16).
const DATA_KEY_FIXED_LEN: usize = 8 + 8 + IV_SIZE;

/// A symmetric key encrypting the records of one or more log files.
///
/// Identified by the `data_key_id` field of a log file's bootstrap header.
/// Once referenced by a log file, a data key is never deleted.
#[derive(Clone, PartialEq, Eq)]
pub struct DataKey {
    /// Registry-assigned id; 0 is reserved to mean "no encryption".
    pub id: u64,
    /// Raw key material. Held decrypted in memory, wrapped on disk.
    pub data: Vec<u8>,
    /// Creation time as unix seconds, drives rotation.
    pub created_at: u64,
    /// IV under which the material is wrapped at rest.
    pub iv: [u8; IV_SIZE],
}

impl DataKey {
    fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DATA_KEY_FIXED_LEN + self.data.len());
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.created_at.to_be_bytes());
        buf.extend_from_slice(&self.iv);
        buf.extend_from_slice(&self.data);
        buf
    }

    fn unmarshal(buf: &[u8]) -> Result<Self> {
        if buf.len() < DATA_KEY_FIXED_LEN {
            return Err(Error::corruption("data key record too short"));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[0..8]);
        let mut created_at = [0u8; 8];
        created_at.copy_from_slice(&buf[8..16]);
        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&buf[16..DATA_KEY_FIXED_LEN]);

        Ok(Self {
            id: u64::from_be_bytes(id),
            data: buf[DATA_KEY_FIXED_LEN..].to_vec(),
            created_at: u64::from_be_bytes(created_at),
            iv,
        })
    }
}

impl Drop for DataKey {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKey")
            .field("id", &self.id)
            .field("data", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

struct Inner {
    data_keys: HashMap<u64, DataKey>,
    next_key_id: u64,
    last_created: u64,
    storage_key: Vec<u8>,
    rotation: Duration,
    read_only: bool,
    /// Append handle to the open registry file. `None` when read-only and
    /// the file never existed.
    file: Option<File>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.storage_key.zeroize();
    }
}

/// Owner of all data keys of one database instance.
///
/// All public operations serialize on a single mutex; rotation is rare and
/// lookups are cheap, so contention is not a concern.
pub struct KeyRegistry {
    inner: Mutex<Inner>,
}

impl KeyRegistry {
    /// Opens the registry in `dir`, creating it when missing and writable.
    ///
    /// # Errors
    ///
    /// - [`Error::EncryptionKeyMismatch`] when the sanity block does not
    ///   decrypt under the supplied storage key
    /// - [`Error::ChecksumMismatch`] on a corrupt data-key record
    /// - [`Error::InvalidKeySize`] for a malformed storage key
    pub fn open(dir: &Path, config: &Config) -> Result<Self> {
        if !config.storage_key.is_empty() {
            crypto::validate_key_size(config.storage_key.len())?;
        }

        let path = dir.join(KEY_REGISTRY_FILE);
        if !path.exists() {
            if config.read_only {
                return Ok(Self::empty(config));
            }
            rewrite_file(dir, &HashMap::new(), &config.storage_key)?;
        }

        let data = fs::read(&path)?;
        let registry = Self::parse(&data, config)?;

        if !config.read_only {
            let file = OpenOptions::new().append(true).open(&path)?;
            registry.inner.lock().file = Some(file);
        }
        Ok(registry)
    }

    fn empty(config: &Config) -> Self {
        Self {
            inner: Mutex::new(Inner {
                data_keys: HashMap::new(),
                next_key_id: 0,
                last_created: 0,
                storage_key: config.storage_key.clone(),
                rotation: config.encryption_key_rotation,
                read_only: config.read_only,
                file: None,
            }),
        }
    }

    fn parse(data: &[u8], config: &Config) -> Result<Self> {
        if data.len() < IV_SIZE + SANITY_TEXT.len() {
            return Err(Error::corruption("registry file too short"));
        }
        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&data[..IV_SIZE]);

        let mut sanity = data[IV_SIZE..IV_SIZE + SANITY_TEXT.len()].to_vec();
        if !config.storage_key.is_empty() {
            crypto::xor_stream(&config.storage_key, &iv, &mut sanity)?;
        }
        if sanity != SANITY_TEXT {
            return Err(Error::EncryptionKeyMismatch);
        }

        let registry = Self::empty(config);
        {
            let mut inner = registry.inner.lock();
            let mut pos = IV_SIZE + SANITY_TEXT.len();
            while pos < data.len() {
                if pos + 8 > data.len() {
                    return Err(Error::corruption("truncated data key length block"));
                }
                let mut len_bytes = [0u8; 4];
                len_bytes.copy_from_slice(&data[pos..pos + 4]);
                let mut crc_bytes = [0u8; 4];
                crc_bytes.copy_from_slice(&data[pos + 4..pos + 8]);
                pos += 8;

                let len = u32::from_be_bytes(len_bytes) as usize;
                let expected = u32::from_be_bytes(crc_bytes);
                if pos + len > data.len() {
                    return Err(Error::corruption("truncated data key record"));
                }
                let record = &data[pos..pos + len];
                pos += len;

                let actual = crc32c::crc32c(record);
                if actual != expected {
                    return Err(Error::ChecksumMismatch { expected, actual });
                }

                let mut data_key = DataKey::unmarshal(record)?;
                if !config.storage_key.is_empty() {
                    crypto::xor_stream(&config.storage_key, &data_key.iv, &mut data_key.data)?;
                }
                inner.next_key_id = inner.next_key_id.max(data_key.id);
                inner.last_created = inner.last_created.max(data_key.created_at);
                inner.data_keys.insert(data_key.id, data_key);
            }
        }
        Ok(registry)
    }

    /// Returns the key to encrypt new log files with, rotating first when
    /// the newest key is older than the rotation period.
    ///
    /// Returns `None` when encryption is disabled. A freshly rotated key is
    /// appended to the registry file and fsynced before it is returned.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if persisting a rotated key fails.
    pub fn current_data_key(&self) -> Result<Option<DataKey>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.storage_key.is_empty() {
            return Ok(None);
        }

        let now = unix_now();
        let age = now.saturating_sub(inner.last_created);
        let rotation_due = age >= inner.rotation.as_secs();
        if !rotation_due || inner.read_only {
            return Ok(inner.data_keys.get(&inner.next_key_id).cloned());
        }

        let data_key = DataKey {
            id: inner.next_key_id + 1,
            data: crypto::generate_key(inner.storage_key.len()),
            created_at: now,
            iv: crypto::generate_iv(),
        };
        let file = inner.file.as_mut().ok_or(Error::ReadOnly)?;
        store_data_key(file, &inner.storage_key, &data_key)?;
        file.sync_data()?;

        debug!(id = data_key.id, "rotated data key");
        inner.next_key_id = data_key.id;
        inner.last_created = data_key.created_at;
        inner.data_keys.insert(data_key.id, data_key.clone());
        Ok(Some(data_key))
    }

    /// Looks up a data key by id. Id 0 is the "no encryption" sentinel and
    /// resolves to `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDataKeyId`] for a nonzero id the registry
    /// does not hold.
    pub fn data_key(&self, id: u64) -> Result<Option<DataKey>> {
        if id == 0 {
            return Ok(None);
        }
        let inner = self.inner.lock();
        inner
            .data_keys
            .get(&id)
            .cloned()
            .map(Some)
            .ok_or(Error::InvalidDataKeyId { id })
    }

    /// Highest data-key id handed out so far.
    #[must_use]
    pub fn next_key_id(&self) -> u64 {
        self.inner.lock().next_key_id
    }

    /// Number of data keys currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().data_keys.len()
    }

    /// Whether the registry holds no data keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrites the registry file from the in-memory state: write to the
    /// rewrite file, fsync, rename over `KEYREGISTRY`, fsync the directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] in read-only mode, or the underlying I/O
    /// error.
    pub fn rewrite(&self, dir: &Path) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.read_only {
            return Err(Error::ReadOnly);
        }
        // The append handle goes stale once the rename lands.
        inner.file = None;
        rewrite_file(dir, &inner.data_keys, &inner.storage_key)?;
        let path = dir.join(KEY_REGISTRY_FILE);
        inner.file = Some(OpenOptions::new().append(true).open(path)?);
        Ok(())
    }
}

impl fmt::Debug for KeyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("KeyRegistry")
            .field("next_key_id", &inner.next_key_id)
            .field("data_keys", &inner.data_keys.len())
            .finish_non_exhaustive()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Appends one `[len][crc][record]` triple, material wrapped under the
/// storage key.
fn store_data_key(file: &mut File, storage_key: &[u8], data_key: &DataKey) -> Result<()> {
    let mut wrapped = data_key.clone();
    if !storage_key.is_empty() {
        crypto::xor_stream(storage_key, &wrapped.iv, &mut wrapped.data)?;
    }
    let record = wrapped.marshal();

    let mut buf = Vec::with_capacity(8 + record.len());
    buf.extend_from_slice(&(record.len() as u32).to_be_bytes());
    buf.extend_from_slice(&crc32c::crc32c(&record).to_be_bytes());
    buf.extend_from_slice(&record);
    file.write_all(&buf)?;
    Ok(())
}

fn rewrite_file(dir: &Path, data_keys: &HashMap<u64, DataKey>, storage_key: &[u8]) -> Result<()> {
    let rewrite_path = dir.join(KEY_REGISTRY_REWRITE_FILE);
    let mut file = File::create(&rewrite_path)?;

    let iv = crypto::generate_iv();
    let mut sanity = SANITY_TEXT.to_vec();
    if !storage_key.is_empty() {
        crypto::xor_stream(storage_key, &iv, &mut sanity)?;
    }
    file.write_all(&iv)?;
    file.write_all(&sanity)?;
    for data_key in data_keys.values() {
        store_data_key(&mut file, storage_key, data_key)?;
    }
    file.sync_all()?;
    drop(file);

    fs::rename(&rewrite_path, dir.join(KEY_REGISTRY_FILE))?;
    crate::logfile::sync_dir(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn encrypted_config(dir: &Path) -> Config {
        Config::new(dir).storage_key(vec![0x42; 16])
    }

    #[test]
    fn open_creates_registry_file() {
        let dir = tempdir().unwrap();
        let registry = KeyRegistry::open(dir.path(), &Config::new(dir.path())).unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.next_key_id(), 0);

        let len = fs::metadata(dir.path().join(KEY_REGISTRY_FILE)).unwrap().len();
        assert_eq!(len as usize, IV_SIZE + SANITY_TEXT.len());
    }

    #[test]
    fn missing_registry_read_only_is_empty() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path()).read_only(true);
        let registry = KeyRegistry::open(dir.path(), &config).unwrap();
        assert!(registry.is_empty());
        assert!(!dir.path().join(KEY_REGISTRY_FILE).exists());
    }

    #[test]
    fn no_storage_key_means_no_data_key() {
        let dir = tempdir().unwrap();
        let registry = KeyRegistry::open(dir.path(), &Config::new(dir.path())).unwrap();
        assert!(registry.current_data_key().unwrap().is_none());
    }

    #[test]
    fn data_key_zero_is_plaintext_sentinel() {
        let dir = tempdir().unwrap();
        let registry = KeyRegistry::open(dir.path(), &encrypted_config(dir.path())).unwrap();
        assert!(registry.data_key(0).unwrap().is_none());
    }

    #[test]
    fn unknown_data_key_id_fails() {
        let dir = tempdir().unwrap();
        let registry = KeyRegistry::open(dir.path(), &encrypted_config(dir.path())).unwrap();
        assert!(matches!(
            registry.data_key(99),
            Err(Error::InvalidDataKeyId { id: 99 })
        ));
    }

    #[test]
    fn first_key_is_created_on_demand() {
        let dir = tempdir().unwrap();
        let registry = KeyRegistry::open(dir.path(), &encrypted_config(dir.path())).unwrap();

        let dk = registry.current_data_key().unwrap().unwrap();
        assert_eq!(dk.id, 1);
        assert_eq!(dk.data.len(), 16);

        // Within the rotation period the same key is handed out again.
        let again = registry.current_data_key().unwrap().unwrap();
        assert_eq!(again.id, 1);
        assert_eq!(again.data, dk.data);
    }

    #[test]
    fn zero_rotation_period_rotates_every_call() {
        let dir = tempdir().unwrap();
        let config = encrypted_config(dir.path()).encryption_key_rotation(Duration::ZERO);
        let registry = KeyRegistry::open(dir.path(), &config).unwrap();

        let first = registry.current_data_key().unwrap().unwrap();
        let second = registry.current_data_key().unwrap().unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_ne!(first.data, second.data);
        drop(registry);

        // Both records persisted; reopen resolves both and reports the
        // highest id.
        let reopened = KeyRegistry::open(dir.path(), &config).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.next_key_id(), 2);
        assert_eq!(reopened.data_key(1).unwrap().unwrap().data, first.data);
        assert_eq!(reopened.data_key(2).unwrap().unwrap().data, second.data);
    }

    #[test]
    fn material_is_wrapped_on_disk() {
        let dir = tempdir().unwrap();
        let registry = KeyRegistry::open(dir.path(), &encrypted_config(dir.path())).unwrap();
        let dk = registry.current_data_key().unwrap().unwrap();

        let raw = fs::read(dir.path().join(KEY_REGISTRY_FILE)).unwrap();
        assert!(!raw.windows(dk.data.len()).any(|w| w == dk.data.as_slice()));
    }

    #[test]
    fn wrong_storage_key_is_rejected() {
        let dir = tempdir().unwrap();
        {
            let registry = KeyRegistry::open(dir.path(), &encrypted_config(dir.path())).unwrap();
            registry.current_data_key().unwrap().unwrap();
        }
        let before = fs::read(dir.path().join(KEY_REGISTRY_FILE)).unwrap();

        let other = Config::new(dir.path()).storage_key(vec![0x43; 16]);
        assert!(matches!(
            KeyRegistry::open(dir.path(), &other),
            Err(Error::EncryptionKeyMismatch)
        ));

        // A failed open must not mutate the file.
        let after = fs::read(dir.path().join(KEY_REGISTRY_FILE)).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn missing_storage_key_is_rejected_for_encrypted_registry() {
        let dir = tempdir().unwrap();
        {
            KeyRegistry::open(dir.path(), &encrypted_config(dir.path())).unwrap();
        }
        assert!(matches!(
            KeyRegistry::open(dir.path(), &Config::new(dir.path())),
            Err(Error::EncryptionKeyMismatch)
        ));
    }

    #[test]
    fn bad_storage_key_size_is_rejected() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path()).storage_key(vec![0u8; 10]);
        assert!(matches!(
            KeyRegistry::open(dir.path(), &config),
            Err(Error::InvalidKeySize { actual: 10 })
        ));
    }

    #[test]
    fn corrupted_record_is_checksum_mismatch() {
        let dir = tempdir().unwrap();
        let config = encrypted_config(dir.path());
        {
            let registry = KeyRegistry::open(dir.path(), &config).unwrap();
            registry.current_data_key().unwrap().unwrap();
        }

        let path = dir.path().join(KEY_REGISTRY_FILE);
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&path, raw).unwrap();

        assert!(matches!(
            KeyRegistry::open(dir.path(), &config),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn rewrite_then_open_is_structurally_equal() {
        let dir = tempdir().unwrap();
        let config = encrypted_config(dir.path()).encryption_key_rotation(Duration::ZERO);
        let registry = KeyRegistry::open(dir.path(), &config).unwrap();
        let k1 = registry.current_data_key().unwrap().unwrap();
        let k2 = registry.current_data_key().unwrap().unwrap();

        registry.rewrite(dir.path()).unwrap();
        drop(registry);

        let reopened = KeyRegistry::open(dir.path(), &config).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.next_key_id(), 2);
        assert_eq!(reopened.data_key(k1.id).unwrap().unwrap(), k1);
        assert_eq!(reopened.data_key(k2.id).unwrap().unwrap(), k2);
    }

    #[test]
    fn registry_survives_append_after_rewrite() {
        let dir = tempdir().unwrap();
        let config = encrypted_config(dir.path()).encryption_key_rotation(Duration::ZERO);
        let registry = KeyRegistry::open(dir.path(), &config).unwrap();
        registry.current_data_key().unwrap().unwrap();
        registry.rewrite(dir.path()).unwrap();

        // The append handle must target the renamed file.
        let dk = registry.current_data_key().unwrap().unwrap();
        assert_eq!(dk.id, 2);
        drop(registry);

        let reopened = KeyRegistry::open(dir.path(), &config).unwrap();
        assert_eq!(reopened.len(), 2);
    }
}
