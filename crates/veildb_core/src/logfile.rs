//! A single append-only log file (WAL or value-log segment).
//!
//! Every file starts with a 20-byte bootstrap header:
//!
//! ```text
//! [0..16)  base_iv          16 random bytes
//! [16..20) data_key_id      u32 big-endian, 0 = no encryption
//! [20..)   framed records
//! ```
//!
//! Appends go through the file descriptor at the atomic write cursor;
//! readers in memory-map mode dereference the mapping under a shared lock.
//! The mapping is sized ahead of the write frontier (the manager maps twice
//! the configured file size at creation), so remapping, the only exclusive
//! section, is rare.

use crate::codec::{self, Crypt};
use crate::config::{Config, LoadingMode};
use crate::crypto::{self, IV_SIZE};
use crate::entry::{Entry, ValuePointer};
use crate::error::{Error, Result};
use crate::registry::{DataKey, KeyRegistry};
use memmap2::{Mmap, MmapOptions};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Size of the bootstrap header at the front of every log file.
pub const LOG_HEADER_SIZE: u32 = (IV_SIZE + 4) as u32;

/// An append-only log file bound to a data key.
pub struct LogFile {
    fid: u32,
    path: PathBuf,
    loading_mode: LoadingMode,
    sync_writes: bool,
    file: File,
    /// Guards the mapping: shared for reads and in-bounds appends,
    /// exclusive only while remapping.
    mmap: RwLock<Option<Mmap>>,
    write_offset: AtomicU32,
    base_iv: [u8; IV_SIZE],
    data_key: Option<DataKey>,
}

impl LogFile {
    /// Opens an existing log file, resolving its data key through the
    /// registry. Files shorter than the bootstrap header are returned
    /// unbound; the caller must [`bootstrap`](Self::bootstrap) them before
    /// appending.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, oversized files, or a bootstrap header naming a
    /// data key the registry does not hold.
    pub fn open(path: PathBuf, fid: u32, config: &Config, registry: &KeyRegistry) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!config.read_only)
            .open(&path)?;
        let size = file.metadata()?.len();
        let size = u32::try_from(size)
            .map_err(|_| Error::corruption(format!("log file too large: {}", path.display())))?;

        let mut lf = Self {
            fid,
            path,
            loading_mode: config.value_log_loading_mode,
            sync_writes: config.sync_writes,
            file,
            mmap: RwLock::new(None),
            write_offset: AtomicU32::new(size),
            base_iv: [0u8; IV_SIZE],
            data_key: None,
        };
        if size >= LOG_HEADER_SIZE {
            lf.read_bootstrap_header(registry)?;
        }
        if size > 0 {
            lf.ensure_mapped(size as usize)?;
        }
        Ok(lf)
    }

    /// Creates a fresh log file, bootstraps it and maps twice the configured
    /// file size ahead of the write frontier.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or if the registry cannot provide a current data
    /// key.
    pub fn create(
        path: PathBuf,
        fid: u32,
        config: &Config,
        registry: &KeyRegistry,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut lf = Self {
            fid,
            path,
            loading_mode: config.value_log_loading_mode,
            sync_writes: config.sync_writes,
            file,
            mmap: RwLock::new(None),
            write_offset: AtomicU32::new(0),
            base_iv: [0u8; IV_SIZE],
            data_key: None,
        };
        lf.bootstrap(registry)?;
        lf.ensure_mapped(2 * config.value_log_file_size as usize)?;
        debug!(fid, path = %lf.path.display(), "created log file");
        Ok(lf)
    }

    fn read_bootstrap_header(&mut self, registry: &KeyRegistry) -> Result<()> {
        let mut header = [0u8; LOG_HEADER_SIZE as usize];
        self.file.read_exact_at(&mut header, 0)?;
        self.base_iv.copy_from_slice(&header[..IV_SIZE]);

        let mut id = [0u8; 4];
        id.copy_from_slice(&header[IV_SIZE..]);
        self.data_key = registry.data_key(u64::from(u32::from_be_bytes(id)))?;
        Ok(())
    }

    /// Writes a fresh bootstrap header: a new base IV and the id of the
    /// registry's current data key (0 when encryption is disabled). Resets
    /// the write cursor past the header.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or registry failures.
    pub fn bootstrap(&mut self, registry: &KeyRegistry) -> Result<()> {
        let base_iv = crypto::generate_iv();
        let data_key = registry.current_data_key()?;
        let key_id = data_key.as_ref().map_or(0, |k| k.id) as u32;

        let mut header = [0u8; LOG_HEADER_SIZE as usize];
        header[..IV_SIZE].copy_from_slice(&base_iv);
        header[IV_SIZE..].copy_from_slice(&key_id.to_be_bytes());
        self.file.write_all_at(&header, 0)?;
        self.file.sync_data()?;

        self.base_iv = base_iv;
        self.data_key = data_key;
        self.write_offset.store(LOG_HEADER_SIZE, Ordering::SeqCst);
        Ok(())
    }

    /// Appends a buffer of framed records at the write cursor and advances
    /// it atomically. Intended for a single writer; readers may observe the
    /// cursor concurrently.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or when the file would exceed the 32-bit offset
    /// space.
    pub fn append(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let offset = self.write_offset.load(Ordering::SeqCst);
        let end = u64::from(offset) + data.len() as u64;
        let end = u32::try_from(end)
            .map_err(|_| Error::corruption("log file exceeds 4 GiB offset space"))?;

        if self.loading_mode == LoadingMode::MemoryMap {
            self.ensure_mapped(end as usize)?;
        }
        let _guard = self.mmap.read();
        self.file.write_all_at(data, u64::from(offset))?;
        if self.sync_writes {
            self.file.sync_data()?;
        }
        self.write_offset.store(end, Ordering::SeqCst);
        Ok(())
    }

    /// Grows the mapping to cover at least `need` bytes. Takes the
    /// exclusive lock only when a remap is actually required.
    pub(crate) fn ensure_mapped(&self, need: usize) -> Result<()> {
        if self.loading_mode != LoadingMode::MemoryMap || need == 0 {
            return Ok(());
        }
        {
            let guard = self.mmap.read();
            if guard.as_ref().map_or(0, |m| m.len()) >= need {
                return Ok(());
            }
        }
        let mut guard = self.mmap.write();
        let current = guard.as_ref().map_or(0, |m| m.len());
        if current >= need {
            return Ok(());
        }
        let len = need.max(current.saturating_mul(2));
        // SAFETY: the mapping is private to this process and only read below
        // the write cursor, which never exceeds bytes already written to the
        // descriptor.
        let map = unsafe { MmapOptions::new().len(len).map(&self.file)? };
        *guard = Some(map);
        Ok(())
    }

    /// Decodes the record a pointer addresses and returns its value bytes,
    /// routed through [`decrypt_kv`](Self::decrypt_kv) when the file is
    /// bound to a data key. The mapping (or the descriptor) is read under
    /// the shared lock for the duration of the call.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPointer`] when the pointer reaches past the write
    ///   cursor
    /// - [`Error::Truncate`] on framing or checksum failures
    pub fn read_value(&self, vp: ValuePointer) -> Result<Vec<u8>> {
        let max = self.file_offset();
        let end = vp
            .offset
            .checked_add(vp.len)
            .ok_or(Error::InvalidPointer {
                offset: vp.offset,
                max,
            })?;
        if end > max {
            return Err(Error::InvalidPointer {
                offset: vp.offset,
                max,
            });
        }

        let guard = self.mmap.read();
        let owned;
        let record: &[u8] = match guard.as_ref() {
            Some(map) if self.loading_mode == LoadingMode::MemoryMap => {
                &map[vp.offset as usize..end as usize]
            }
            _ => {
                let mut buf = vec![0u8; vp.len as usize];
                self.file.read_exact_at(&mut buf, u64::from(vp.offset))?;
                owned = buf;
                &owned
            }
        };

        let (header, header_len) = codec::check_frame(record)?;
        let klen = header.klen as usize;
        let vlen = header.vlen as usize;
        let mut kv = record[header_len..header_len + klen + vlen].to_vec();
        self.decrypt_kv(&mut kv, vp.offset)?;
        Ok(kv.split_off(klen))
    }

    /// Encodes an entry into `buf` as it will appear at `entry_offset` in
    /// this file, encrypting under the file's data key when one is bound.
    ///
    /// # Errors
    ///
    /// Propagates codec failures.
    pub fn encode_entry(&self, entry: &Entry, buf: &mut Vec<u8>, entry_offset: u32) -> Result<usize> {
        codec::encode_entry(entry, buf, entry_offset, self.crypt())
    }

    /// XOR-streams a `key|value` region in place with the IV derived for
    /// `entry_offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKeySize`] if the bound key is malformed.
    pub fn decrypt_kv(&self, kv: &mut [u8], entry_offset: u32) -> Result<()> {
        if let Some(data_key) = &self.data_key {
            let iv = crypto::record_iv(&self.base_iv, entry_offset);
            crypto::xor_stream(&data_key.data, &iv, kv)?;
        }
        Ok(())
    }

    /// Whether the file is bound to a data key.
    #[must_use]
    pub fn encryption_enabled(&self) -> bool {
        self.data_key.is_some()
    }

    /// Current write cursor. Bytes below it are written and immutable.
    #[must_use]
    pub fn file_offset(&self) -> u32 {
        self.write_offset.load(Ordering::SeqCst)
    }

    /// File id.
    #[must_use]
    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shrinks the file back to `offset`, discarding a torn suffix.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn truncate(&self, offset: u32) -> Result<()> {
        self.file.set_len(u64::from(offset))?;
        self.file.sync_all()?;
        self.write_offset.store(offset, Ordering::SeqCst);
        Ok(())
    }

    /// Flushes written bytes to durable storage.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub(crate) fn crypt(&self) -> Option<Crypt<'_>> {
        self.data_key.as_ref().map(|key| (key, &self.base_iv))
    }

    pub(crate) fn data_key(&self) -> Option<&DataKey> {
        self.data_key.as_ref()
    }

    pub(crate) fn base_iv(&self) -> &[u8; IV_SIZE] {
        &self.base_iv
    }
}

impl std::fmt::Debug for LogFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFile")
            .field("fid", &self.fid)
            .field("path", &self.path)
            .field("write_offset", &self.file_offset())
            .field("encrypted", &self.encryption_enabled())
            .finish_non_exhaustive()
    }
}

/// Fsyncs a directory so entry creations, renames and deletions are
/// durable.
#[cfg(unix)]
pub(crate) fn sync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::key_with_ts;
    use std::time::Duration;
    use tempfile::tempdir;

    fn plain_config(dir: &Path) -> Config {
        Config::new(dir).value_log_file_size(1024 * 1024)
    }

    fn encrypted_config(dir: &Path) -> Config {
        plain_config(dir)
            .storage_key(vec![0x42; 16])
            .encryption_key_rotation(Duration::from_secs(864_000))
    }

    fn registry(config: &Config) -> KeyRegistry {
        KeyRegistry::open(&config.value_dir, config).unwrap()
    }

    #[test]
    fn create_writes_bootstrap_header() {
        let dir = tempdir().unwrap();
        let config = plain_config(dir.path());
        let reg = registry(&config);

        let lf = LogFile::create(dir.path().join("000001.vlog"), 1, &config, &reg).unwrap();
        assert_eq!(lf.file_offset(), LOG_HEADER_SIZE);
        assert!(!lf.encryption_enabled());

        let raw = std::fs::read(lf.path()).unwrap();
        assert_eq!(raw.len() as u32, LOG_HEADER_SIZE);
        // Plaintext files record the null key id.
        assert_eq!(&raw[16..20], &[0, 0, 0, 0]);
    }

    #[test]
    fn encrypted_create_binds_current_key() {
        let dir = tempdir().unwrap();
        let config = encrypted_config(dir.path());
        let reg = registry(&config);

        let lf = LogFile::create(dir.path().join("000001.vlog"), 1, &config, &reg).unwrap();
        assert!(lf.encryption_enabled());

        let raw = std::fs::read(lf.path()).unwrap();
        assert_eq!(&raw[16..20], &1u32.to_be_bytes());
    }

    #[test]
    fn append_advances_offset_and_roundtrips() {
        let dir = tempdir().unwrap();
        let config = plain_config(dir.path());
        let reg = registry(&config);
        let lf = LogFile::create(dir.path().join("000001.vlog"), 1, &config, &reg).unwrap();

        let mut entry = Entry::new(key_with_ts(b"k", 9), vec![0xAB; 300]);
        entry.meta = crate::entry::BIT_TXN;

        let mut buf = Vec::new();
        let offset = lf.file_offset();
        let len = lf.encode_entry(&entry, &mut buf, offset).unwrap();
        lf.append(&buf).unwrap();
        assert_eq!(lf.file_offset(), offset + len as u32);

        let vp = ValuePointer {
            fid: 1,
            offset,
            len: len as u32,
        };
        assert_eq!(lf.read_value(vp).unwrap(), entry.value);
    }

    #[test]
    fn encrypted_roundtrip_across_reopen() {
        let dir = tempdir().unwrap();
        let config = encrypted_config(dir.path());
        let reg = registry(&config);

        let path = dir.path().join("000001.vlog");
        let (offset, len, value) = {
            let lf = LogFile::create(path.clone(), 1, &config, &reg).unwrap();
            let entry = Entry::new(key_with_ts(b"secret", 4), vec![0x5A; 128]);
            let mut buf = Vec::new();
            let offset = lf.file_offset();
            let len = lf.encode_entry(&entry, &mut buf, offset).unwrap();
            lf.append(&buf).unwrap();
            lf.sync().unwrap();
            (offset, len as u32, entry.value)
        };

        // Value bytes must not appear in plaintext on disk.
        let raw = std::fs::read(&path).unwrap();
        assert!(!raw.windows(value.len()).any(|w| w == value.as_slice()));

        let lf = LogFile::open(path, 1, &config, &reg).unwrap();
        assert!(lf.encryption_enabled());
        let vp = ValuePointer { fid: 1, offset, len };
        assert_eq!(lf.read_value(vp).unwrap(), value);
    }

    #[test]
    fn file_io_mode_reads_through_descriptor() {
        let dir = tempdir().unwrap();
        let config = plain_config(dir.path()).value_log_loading_mode(LoadingMode::FileIo);
        let reg = registry(&config);
        let lf = LogFile::create(dir.path().join("000001.vlog"), 1, &config, &reg).unwrap();

        let entry = Entry::new(key_with_ts(b"k", 1), b"file-io value".to_vec());
        let mut buf = Vec::new();
        let offset = lf.file_offset();
        let len = lf.encode_entry(&entry, &mut buf, offset).unwrap();
        lf.append(&buf).unwrap();

        let vp = ValuePointer {
            fid: 1,
            offset,
            len: len as u32,
        };
        assert_eq!(lf.read_value(vp).unwrap(), entry.value);
    }

    #[test]
    fn pointer_past_write_cursor_is_invalid() {
        let dir = tempdir().unwrap();
        let config = plain_config(dir.path());
        let reg = registry(&config);
        let lf = LogFile::create(dir.path().join("000001.vlog"), 1, &config, &reg).unwrap();

        let vp = ValuePointer {
            fid: 1,
            offset: LOG_HEADER_SIZE,
            len: 10,
        };
        assert!(matches!(
            lf.read_value(vp),
            Err(Error::InvalidPointer { .. })
        ));
    }

    #[test]
    fn truncate_discards_suffix() {
        let dir = tempdir().unwrap();
        let config = plain_config(dir.path());
        let reg = registry(&config);
        let lf = LogFile::create(dir.path().join("000001.log"), 1, &config, &reg).unwrap();

        lf.append(&[0xEE; 64]).unwrap();
        assert_eq!(lf.file_offset(), LOG_HEADER_SIZE + 64);

        lf.truncate(LOG_HEADER_SIZE).unwrap();
        assert_eq!(lf.file_offset(), LOG_HEADER_SIZE);
        assert_eq!(
            std::fs::metadata(lf.path()).unwrap().len(),
            u64::from(LOG_HEADER_SIZE)
        );
    }

    #[test]
    fn remap_grows_with_appends() {
        let dir = tempdir().unwrap();
        // Tiny configured size forces the initial mapping to be small.
        let config = Config::new(dir.path()).value_log_file_size(64);
        let reg = registry(&config);
        let lf = LogFile::create(dir.path().join("000001.vlog"), 1, &config, &reg).unwrap();

        let entry = Entry::new(key_with_ts(b"big", 3), vec![0x77; 4096]);
        let mut buf = Vec::new();
        let offset = lf.file_offset();
        let len = lf.encode_entry(&entry, &mut buf, offset).unwrap();
        lf.append(&buf).unwrap();

        let vp = ValuePointer {
            fid: 1,
            offset,
            len: len as u32,
        };
        assert_eq!(lf.read_value(vp).unwrap(), entry.value);
    }
}
