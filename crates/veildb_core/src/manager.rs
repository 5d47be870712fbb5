//! The log manager: owner of the current WAL and value log.
//!
//! The manager routes each incoming entry by size: small values are encoded
//! into the WAL, large values into the value log with a
//! `(fid, offset, len)` pointer returned for the LSM. Both streams of a
//! request batch end with markers carrying the batch's commit timestamp,
//! which is what lets recovery match them after a crash.
//!
//! Reads by pointer go to the value-log map under a shared lock; the write
//! path is serialized by a single writer mutex and is the only place files
//! roll.

use crate::config::Config;
use crate::entry::{Entry, Request, ValuePointer};
use crate::error::{Error, Result};
use crate::logfile::{sync_dir, LogFile, LOG_HEADER_SIZE};
use crate::registry::KeyRegistry;
use crate::replay;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Path of a WAL segment inside the value directory.
pub(crate) fn wal_file_path(dir: &Path, fid: u32) -> PathBuf {
    dir.join(format!("{fid:06}.log"))
}

/// Path of a value-log segment inside the value directory.
pub(crate) fn vlog_file_path(dir: &Path, fid: u32) -> PathBuf {
    dir.join(format!("{fid:06}.vlog"))
}

/// Mutable writer-side state: the currently appendable files and the
/// highest ids handed out.
struct WriterState {
    wal: Option<Arc<LogFile>>,
    vlog: Option<Arc<LogFile>>,
    max_wal_id: u32,
    max_vlog_id: u32,
}

/// Process-wide owner of the open log files of one database instance.
pub struct LogManager {
    config: Config,
    registry: Arc<KeyRegistry>,
    writer: Mutex<WriterState>,
    /// Historical and current value-log files by id, for pointer reads.
    vlog_map: RwLock<HashMap<u32, Arc<LogFile>>>,
    /// Mirror of the writer's `max_vlog_id` for the lock-free read-path
    /// frontier check.
    max_vlog_id: AtomicU32,
}

impl LogManager {
    /// Opens the log manager over `config.value_dir`.
    ///
    /// WAL segments at or below `wal_head` hold data already flushed into
    /// sorted tables and are deleted (kept when read-only); the rest are
    /// replayed against the value logs from `vlog_head` on, and `replay_fn`
    /// receives every entry of every matched batch. Torn suffixes are
    /// truncated before the manager goes live.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, registry failures (including
    /// [`Error::EncryptionKeyMismatch`]) and unrecoverable corruption.
    pub fn open<F>(
        config: Config,
        vlog_head: ValuePointer,
        wal_head: u32,
        mut replay_fn: F,
    ) -> Result<Self>
    where
        F: FnMut(&Entry, ValuePointer) -> Result<()>,
    {
        if !config.read_only {
            fs::create_dir_all(&config.value_dir)?;
        }
        let registry = Arc::new(KeyRegistry::open(&config.value_dir, &config)?);

        let mut max_wal_id = 0u32;
        let mut max_vlog_id = 0u32;
        let mut replay_wal_ids = Vec::new();
        let mut all_vlog_ids = Vec::new();
        let mut deleted = false;

        for dir_entry in fs::read_dir(&config.value_dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".log") {
                let Ok(fid) = stem.parse::<u32>() else {
                    continue;
                };
                max_wal_id = max_wal_id.max(fid);
                if fid <= wal_head {
                    // Content already lives in sorted tables.
                    if !config.read_only {
                        fs::remove_file(dir_entry.path())?;
                        deleted = true;
                    }
                } else {
                    replay_wal_ids.push(fid);
                }
            } else if let Some(stem) = name.strip_suffix(".vlog") {
                let Ok(fid) = stem.parse::<u32>() else {
                    continue;
                };
                max_vlog_id = max_vlog_id.max(fid);
                all_vlog_ids.push(fid);
            }
        }
        if deleted {
            sync_dir(&config.value_dir)?;
        }

        replay_wal_ids.sort_unstable();
        all_vlog_ids.sort_unstable();
        let replay_vlog_ids: Vec<u32> = all_vlog_ids
            .iter()
            .copied()
            .filter(|&fid| fid >= vlog_head.fid)
            .collect();

        debug!(
            wal_segments = replay_wal_ids.len(),
            vlog_segments = replay_vlog_ids.len(),
            "opening log manager"
        );
        let outcome = replay::replay(
            &config,
            &registry,
            &replay_wal_ids,
            &replay_vlog_ids,
            vlog_head,
            &mut replay_fn,
        )?;
        Self::apply_truncation(&config, outcome)?;

        let manager = Self {
            registry,
            writer: Mutex::new(WriterState {
                wal: None,
                vlog: None,
                max_wal_id,
                max_vlog_id,
            }),
            vlog_map: RwLock::new(HashMap::new()),
            max_vlog_id: AtomicU32::new(max_vlog_id),
            config,
        };

        if max_wal_id == 0 {
            // Fresh directory.
            debug_assert_eq!(max_vlog_id, 0);
            if manager.config.read_only {
                return Ok(manager);
            }
            let mut state = manager.writer.lock();
            manager.create_wal(&mut state)?;
            manager.create_vlog(&mut state)?;
            drop(state);
            return Ok(manager);
        }

        // Reopen every value log for pointer reads.
        {
            let mut map = manager.vlog_map.write();
            for &fid in &all_vlog_ids {
                let path = vlog_file_path(&manager.config.value_dir, fid);
                let file = LogFile::open(path, fid, &manager.config, &manager.registry)?;
                map.insert(fid, Arc::new(file));
            }
        }

        if manager.config.read_only {
            return Ok(manager);
        }

        let mut state = manager.writer.lock();
        if max_wal_id == wal_head {
            // The newest WAL is fully flushed; start a new one.
            manager.create_wal(&mut state)?;
        } else {
            let path = wal_file_path(&manager.config.value_dir, max_wal_id);
            let wal = LogFile::open(path, max_wal_id, &manager.config, &manager.registry)?;
            wal.ensure_mapped(2 * manager.config.value_log_file_size as usize)?;
            state.wal = Some(Arc::new(wal));
        }

        if state.max_vlog_id == 0 {
            manager.create_vlog(&mut state)?;
        } else {
            let current = manager
                .vlog_map
                .read()
                .get(&state.max_vlog_id)
                .cloned()
                .ok_or_else(|| Error::corruption("newest value log missing from map"))?;
            current.ensure_mapped(2 * manager.config.value_log_file_size as usize)?;
            state.vlog = Some(current);
        }
        drop(state);
        Ok(manager)
    }

    fn apply_truncation(config: &Config, outcome: replay::ReplayOutcome) -> Result<()> {
        for target in outcome.truncate {
            if config.read_only {
                warn!(
                    path = %target.path.display(),
                    valid_offset = target.valid_offset,
                    "log needs truncation but manager is read-only"
                );
                continue;
            }
            if target.valid_offset < LOG_HEADER_SIZE {
                return Err(Error::corruption(
                    "truncation point inside the bootstrap header",
                ));
            }
            let file = OpenOptions::new().write(true).open(&target.path)?;
            let len = file.metadata()?.len();
            if len > u64::from(target.valid_offset) {
                warn!(
                    path = %target.path.display(),
                    from = len,
                    to = target.valid_offset,
                    "truncating torn log suffix"
                );
                file.set_len(u64::from(target.valid_offset))?;
                file.sync_all()?;
            }
        }
        Ok(())
    }

    fn create_wal(&self, state: &mut WriterState) -> Result<()> {
        let fid = state.max_wal_id + 1;
        let path = wal_file_path(&self.config.value_dir, fid);
        let wal = LogFile::create(path, fid, &self.config, &self.registry)?;
        sync_dir(&self.config.value_dir)?;
        state.max_wal_id = fid;
        state.wal = Some(Arc::new(wal));
        Ok(())
    }

    fn create_vlog(&self, state: &mut WriterState) -> Result<()> {
        let fid = state.max_vlog_id + 1;
        let path = vlog_file_path(&self.config.value_dir, fid);
        let vlog = Arc::new(LogFile::create(path, fid, &self.config, &self.registry)?);
        sync_dir(&self.config.value_dir)?;
        state.max_vlog_id = fid;
        state.vlog = Some(Arc::clone(&vlog));
        self.vlog_map.write().insert(fid, vlog);
        self.max_vlog_id.store(fid, Ordering::SeqCst);
        Ok(())
    }

    /// Persists a slice of request batches.
    ///
    /// For each request the last two entries are the reserved end markers
    /// (WAL and vlog respectively). Entries route to the WAL when their
    /// value fits `value_threshold`, otherwise to the value log;
    /// `request.ptrs` is rebuilt with one pointer per entry (empty for
    /// WAL-resident entries). The WAL buffer is flushed before the vlog
    /// buffer, and a file whose offset passed `value_log_file_size` is
    /// rolled afterwards.
    ///
    /// # Errors
    ///
    /// Fails in read-only mode, on malformed requests, and on I/O errors;
    /// an I/O failure aborts the whole batch for the caller to retry.
    pub fn write(&self, requests: &mut [Request]) -> Result<()> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        let mut state = self.writer.lock();
        let wal = state.wal.clone().ok_or(Error::ReadOnly)?;
        let vlog = state.vlog.clone().ok_or(Error::ReadOnly)?;

        let mut wal_buf = Vec::new();
        let mut vlog_buf = Vec::new();

        for request in requests.iter_mut() {
            if request.entries.len() < 2 {
                return Err(Error::invalid_argument(
                    "request is missing its end markers",
                ));
            }
            request.ptrs.clear();
            let marker_start = request.entries.len() - 2;

            for entry in &request.entries[..marker_start] {
                if entry.skip_vlog {
                    request.ptrs.push(ValuePointer::default());
                    continue;
                }
                if entry.value.len() <= self.config.value_threshold {
                    let offset = buffered_offset(&wal, &wal_buf)?;
                    wal.encode_entry(entry, &mut wal_buf, offset)?;
                    request.ptrs.push(ValuePointer::default());
                } else {
                    let offset = buffered_offset(&vlog, &vlog_buf)?;
                    let len = vlog.encode_entry(entry, &mut vlog_buf, offset)?;
                    request.ptrs.push(ValuePointer {
                        fid: vlog.fid(),
                        offset,
                        len: len as u32,
                    });
                }
            }

            // End markers: one per stream, same commit timestamp.
            let offset = buffered_offset(&wal, &wal_buf)?;
            wal.encode_entry(&request.entries[marker_start], &mut wal_buf, offset)?;
            request.ptrs.push(ValuePointer::default());

            let offset = buffered_offset(&vlog, &vlog_buf)?;
            vlog.encode_entry(&request.entries[marker_start + 1], &mut vlog_buf, offset)?;
            request.ptrs.push(ValuePointer::default());
        }

        // WAL first: a crash between the two flushes leaves a WAL suffix
        // with no vlog counterpart, which replay detects and truncates.
        wal.append(&wal_buf)?;
        vlog.append(&vlog_buf)?;

        if wal.file_offset() > self.config.value_log_file_size {
            wal.sync()?;
            self.create_wal(&mut state)?;
            debug!(fid = state.max_wal_id, "rolled write-ahead log");
        }
        if vlog.file_offset() > self.config.value_log_file_size {
            vlog.sync()?;
            self.create_vlog(&mut state)?;
            debug!(fid = state.max_vlog_id, "rolled value log");
        }
        Ok(())
    }

    /// Resolves a value pointer to its value bytes.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPointer`] for offsets at or past the write
    ///   frontier of the active value log (never retried)
    /// - [`Error::Retry`] when the file has been garbage collected
    pub fn read(&self, vp: ValuePointer) -> Result<Vec<u8>> {
        let max_fid = self.max_vlog_id.load(Ordering::SeqCst);
        if vp.fid == max_fid {
            if let Some(current) = self.vlog_map.read().get(&max_fid) {
                let frontier = current.file_offset();
                if vp.offset >= frontier {
                    return Err(Error::InvalidPointer {
                        offset: vp.offset,
                        max: frontier,
                    });
                }
            }
        }
        let file = self
            .vlog_map
            .read()
            .get(&vp.fid)
            .cloned()
            .ok_or(Error::Retry)?;
        file.read_value(vp)
    }

    /// Flushes both current log files to durable storage.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn sync(&self) -> Result<()> {
        let state = self.writer.lock();
        if let Some(wal) = &state.wal {
            wal.sync()?;
        }
        if let Some(vlog) = &state.vlog {
            vlog.sync()?;
        }
        Ok(())
    }

    /// Flushes both current log files and releases every open log handle.
    ///
    /// A closed manager accepts no further traffic: writes fail like
    /// read-only mode and pointer reads return [`Error::Retry`]. Reopen
    /// the manager to resume.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors while flushing.
    pub fn close(&self) -> Result<()> {
        let mut state = self.writer.lock();
        if let Some(wal) = state.wal.take() {
            wal.sync()?;
        }
        if let Some(vlog) = state.vlog.take() {
            vlog.sync()?;
        }
        self.vlog_map.write().clear();
        debug!(value_dir = %self.config.value_dir.display(), "closed log manager");
        Ok(())
    }

    /// The key registry backing this manager's log files.
    #[must_use]
    pub fn key_registry(&self) -> &Arc<KeyRegistry> {
        &self.registry
    }

    /// Highest WAL id handed out.
    #[must_use]
    pub fn max_wal_id(&self) -> u32 {
        self.writer.lock().max_wal_id
    }

    /// Highest value-log id handed out.
    #[must_use]
    pub fn max_vlog_id(&self) -> u32 {
        self.max_vlog_id.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogManager")
            .field("value_dir", &self.config.value_dir)
            .field("max_vlog_id", &self.max_vlog_id())
            .finish_non_exhaustive()
    }
}

/// Offset an entry will land at: the file's write frontier plus the bytes
/// already buffered ahead of it.
fn buffered_offset(file: &LogFile, buf: &[u8]) -> Result<u32> {
    let offset = u64::from(file.file_offset()) + buf.len() as u64;
    u32::try_from(offset).map_err(|_| Error::corruption("log file exceeds 4 GiB offset space"))
}
