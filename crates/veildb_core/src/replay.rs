//! Cross-stream crash recovery.
//!
//! The replayer walks the filtered WAL and value-log id lists in lockstep,
//! one transaction batch at a time. Both streams of a batch were written
//! with end markers carrying the same commit timestamp, so a divergence
//! between them marks the point where durable state ends: everything past
//! the last matched batch is a torn suffix and is reported for truncation.
//!
//! The truncation point of a stream only advances once a batch has been
//! matched against the other stream and handed to the replay callback.

use crate::codec::{self, Crypt, CRC_SIZE, MAX_HEADER_SIZE};
use crate::config::Config;
use crate::crypto::IV_SIZE;
use crate::entry::{Entry, ValuePointer, BIT_FIN_TXN, BIT_TXN};
use crate::error::{Error, Result};
use crate::logfile::{LogFile, LOG_HEADER_SIZE};
use crate::registry::{DataKey, KeyRegistry};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Read granularity of the streaming iterator.
const READ_CHUNK: usize = 64 * 1024;

/// Callback receiving replayed entries. Value-log entries come with their
/// pointer; WAL-resident entries come with the empty pointer.
pub type ReplayFn<'a> = dyn FnMut(&Entry, ValuePointer) -> Result<()> + 'a;

/// One decoded transaction batch: the non-terminator entries, the commit
/// timestamp, and the offset just past the terminator.
pub(crate) struct TxnBatch {
    pub entries: Vec<Entry>,
    pub commit_ts: u64,
    pub end_offset: u32,
}

/// Streaming reader over one log file's framed records.
///
/// Reads through its own descriptor with a bounded carry buffer, so replay
/// memory stays constant regardless of file size.
pub(crate) struct LogIterator {
    file: File,
    file_size: u32,
    /// Absolute offset of `buf[0]` within the file.
    window_start: u32,
    buf: Vec<u8>,
    pos: usize,
    crypt: Option<(DataKey, [u8; IV_SIZE])>,
}

impl LogIterator {
    pub(crate) fn new(log: &LogFile, start_offset: u32) -> Result<Self> {
        let file = File::open(log.path())?;
        Ok(Self {
            file,
            file_size: log.file_offset(),
            window_start: start_offset,
            buf: Vec::new(),
            pos: 0,
            crypt: log
                .data_key()
                .map(|key| (key.clone(), *log.base_iv())),
        })
    }

    fn crypt_ref(&self) -> Option<Crypt<'_>> {
        self.crypt.as_ref().map(|(key, iv)| (key, iv))
    }

    /// Absolute offset of the next unread byte.
    fn offset(&self) -> u32 {
        self.window_start + self.pos as u32
    }

    /// Buffers at least `n` unread bytes when the file still has them.
    /// Returns false near end of file; whatever remains is buffered so the
    /// caller can distinguish a short tail from a clean end.
    fn ensure(&mut self, n: usize) -> Result<bool> {
        let available = self.buf.len() - self.pos;
        if available >= n {
            return Ok(true);
        }
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.window_start += self.pos as u32;
            self.pos = 0;
        }

        let buffered_end = u64::from(self.window_start) + self.buf.len() as u64;
        let file_remaining =
            usize::try_from(u64::from(self.file_size).saturating_sub(buffered_end))
                .unwrap_or(usize::MAX);
        let want = n - self.buf.len();
        let chunk = want.max(READ_CHUNK).min(file_remaining);
        if chunk > 0 {
            let old_len = self.buf.len();
            self.buf.resize(old_len + chunk, 0);
            self.file.read_exact_at(&mut self.buf[old_len..], buffered_end)?;
        }
        Ok(self.buf.len() >= n)
    }

    /// Decodes the next framed record.
    ///
    /// Returns [`Error::Eof`] at the clean end of the written region and
    /// [`Error::Truncate`] for a partial or corrupt record.
    fn next_entry(&mut self) -> Result<Entry> {
        let entry_offset = self.offset();
        if entry_offset >= self.file_size {
            return Err(Error::Eof);
        }

        // Best effort: a record can be shorter than the maximum header.
        self.ensure(MAX_HEADER_SIZE + CRC_SIZE)?;
        let (header, header_len) = codec::Header::decode(&self.buf[self.pos..])?;
        let total =
            header_len + header.klen as usize + header.vlen as usize + CRC_SIZE;
        if u64::from(entry_offset) + total as u64 > u64::from(self.file_size) {
            return Err(Error::Truncate);
        }
        if !self.ensure(total)? {
            return Err(Error::Truncate);
        }

        let window = &self.buf[self.pos..self.pos + total];
        let (entry, consumed) = codec::decode_entry(window, entry_offset, self.crypt_ref())?;
        self.pos += consumed;
        Ok(entry)
    }

    /// Reads one transaction batch: `BIT_TXN` entries accumulate under a
    /// single commit timestamp until the `BIT_FIN_TXN` terminator confirms
    /// it. Any inconsistency yields [`Error::Truncate`] with the batch
    /// discarded.
    pub(crate) fn iterate_entries(&mut self) -> Result<TxnBatch> {
        let mut entries = Vec::new();
        let mut commit_ts = 0u64;
        loop {
            let entry = self.next_entry()?;

            if entry.meta & BIT_TXN != 0 {
                let ts = crate::entry::parse_ts(&entry.key);
                if commit_ts == 0 {
                    commit_ts = ts;
                }
                if commit_ts != ts {
                    return Err(Error::Truncate);
                }
                entries.push(entry);
                continue;
            }

            if entry.meta & BIT_FIN_TXN != 0 {
                let ts = std::str::from_utf8(&entry.value)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or(Error::Truncate)?;
                // A stream whose batch routed every value to the other
                // family carries only the terminator.
                if commit_ts == 0 && entries.is_empty() {
                    commit_ts = ts;
                }
                if commit_ts != ts {
                    return Err(Error::Truncate);
                }
                return Ok(TxnBatch {
                    entries,
                    commit_ts,
                    end_offset: self.offset(),
                });
            }

            // Entries outside a transaction carry nothing to replay.
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Wal,
    Vlog,
}

impl StreamKind {
    fn path(self, dir: &Path, fid: u32) -> PathBuf {
        match self {
            Self::Wal => crate::manager::wal_file_path(dir, fid),
            Self::Vlog => crate::manager::vlog_file_path(dir, fid),
        }
    }
}

enum StreamStep {
    Batch(TxnBatch),
    End,
}

/// One log family (WAL or vlog) during replay: the ordered id list, the
/// file currently open, and the offset up to which batches have been
/// cross-stream matched.
struct LogStream<'a> {
    kind: StreamKind,
    ids: &'a [u32],
    index: usize,
    file: LogFile,
    iter: LogIterator,
    valid_offset: u32,
    config: &'a Config,
    registry: &'a KeyRegistry,
}

impl<'a> LogStream<'a> {
    fn open(
        kind: StreamKind,
        ids: &'a [u32],
        start_offset: u32,
        config: &'a Config,
        registry: &'a KeyRegistry,
    ) -> Result<Self> {
        let fid = ids[0];
        let file = open_stream_file(kind, fid, config, registry)?;
        let start = start_offset.max(LOG_HEADER_SIZE);
        let iter = LogIterator::new(&file, start)?;
        Ok(Self {
            kind,
            ids,
            index: 0,
            file,
            iter,
            valid_offset: start,
            config,
            registry,
        })
    }

    fn current_fid(&self) -> u32 {
        self.ids[self.index]
    }

    fn path(&self) -> PathBuf {
        self.file.path().to_path_buf()
    }

    fn mark_valid(&mut self, offset: u32) {
        self.valid_offset = offset;
    }

    /// Next batch of this family, advancing across file boundaries.
    ///
    /// [`Error::Truncate`] means this stream needs truncation at its
    /// current `valid_offset`: either a torn record, or trailing bytes past
    /// the last matched batch at end of file.
    fn next_batch(&mut self) -> Result<StreamStep> {
        loop {
            match self.iter.iterate_entries() {
                Ok(batch) => return Ok(StreamStep::Batch(batch)),
                Err(Error::Eof) => {
                    if self.file.file_offset() != self.valid_offset {
                        return Err(Error::Truncate);
                    }
                    if self.index + 1 >= self.ids.len() {
                        return Ok(StreamStep::End);
                    }
                    self.index += 1;
                    let fid = self.ids[self.index];
                    let file =
                        open_stream_file(self.kind, fid, self.config, self.registry)?;
                    self.iter = LogIterator::new(&file, LOG_HEADER_SIZE)?;
                    self.file = file;
                    self.valid_offset = LOG_HEADER_SIZE;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn open_stream_file(
    kind: StreamKind,
    fid: u32,
    config: &Config,
    registry: &KeyRegistry,
) -> Result<LogFile> {
    let path = kind.path(&config.value_dir, fid);
    let mut file = LogFile::open(path, fid, config, registry)?;
    if file.file_offset() < LOG_HEADER_SIZE && !config.read_only {
        file.bootstrap(registry)?;
    }
    Ok(file)
}

/// A file the manager must truncate back to its last valid offset.
pub(crate) struct TruncateTarget {
    pub path: PathBuf,
    pub valid_offset: u32,
}

/// Result of a replay pass.
pub(crate) struct ReplayOutcome {
    pub truncate: Vec<TruncateTarget>,
}

/// Replays both log families in lockstep, invoking `replay_fn` for every
/// entry of every matched batch. Returns the truncation targets for torn
/// suffixes; applying them is the manager's job.
pub(crate) fn replay(
    config: &Config,
    registry: &KeyRegistry,
    wal_ids: &[u32],
    vlog_ids: &[u32],
    vlog_head: ValuePointer,
    replay_fn: &mut ReplayFn<'_>,
) -> Result<ReplayOutcome> {
    let mut outcome = ReplayOutcome {
        truncate: Vec::new(),
    };
    if wal_ids.is_empty() || vlog_ids.is_empty() {
        return Ok(outcome);
    }

    let vlog_start = if vlog_ids[0] == vlog_head.fid {
        vlog_head.offset
    } else {
        LOG_HEADER_SIZE
    };
    let mut wal = LogStream::open(StreamKind::Wal, wal_ids, LOG_HEADER_SIZE, config, registry)?;
    let mut vlog = LogStream::open(StreamKind::Vlog, vlog_ids, vlog_start, config, registry)?;

    let mut batches = 0u64;
    let mut truncate_needed = false;
    loop {
        let wal_step = match wal.next_batch() {
            Ok(step) => step,
            Err(Error::Truncate) => {
                truncate_needed = true;
                break;
            }
            Err(err) => return Err(err),
        };
        let vlog_step = match vlog.next_batch() {
            Ok(step) => step,
            Err(Error::Truncate) => {
                truncate_needed = true;
                break;
            }
            Err(err) => return Err(err),
        };

        match (wal_step, vlog_step) {
            (StreamStep::End, StreamStep::End) => break,
            (StreamStep::Batch(wal_batch), StreamStep::Batch(vlog_batch)) => {
                if wal_batch.commit_ts != vlog_batch.commit_ts {
                    warn!(
                        wal_ts = wal_batch.commit_ts,
                        vlog_ts = vlog_batch.commit_ts,
                        "commit timestamp mismatch between log families"
                    );
                    truncate_needed = true;
                    break;
                }
                for entry in &wal_batch.entries {
                    replay_fn(entry, ValuePointer::default())?;
                }
                for entry in &vlog_batch.entries {
                    let vp = ValuePointer {
                        fid: vlog.current_fid(),
                        offset: entry.offset,
                        len: entry.header_len
                            + entry.key.len() as u32
                            + entry.value.len() as u32
                            + CRC_SIZE as u32,
                    };
                    replay_fn(entry, vp)?;
                }
                wal.mark_valid(wal_batch.end_offset);
                vlog.mark_valid(vlog_batch.end_offset);
                batches += 1;
            }
            // One family ran out while the other still holds a batch; that
            // batch has no counterpart and must go.
            _ => {
                truncate_needed = true;
                break;
            }
        }
    }

    debug!(batches, truncate_needed, "log replay finished");
    if truncate_needed {
        outcome.truncate.push(TruncateTarget {
            path: wal.path(),
            valid_offset: wal.valid_offset,
        });
        outcome.truncate.push(TruncateTarget {
            path: vlog.path(),
            valid_offset: vlog.valid_offset,
        });
    }
    Ok(outcome)
}
