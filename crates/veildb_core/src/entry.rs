//! Log entry and value pointer types.

/// Entry is part of a transaction batch.
pub const BIT_TXN: u8 = 1 << 6;
/// Entry terminates a transaction batch; its value is the decimal commit
/// timestamp.
pub const BIT_FIN_TXN: u8 = 1 << 7;
/// Entry is a tombstone.
pub const BIT_DELETE: u8 = 1 << 0;
/// Entry's value is a pointer into the value log.
pub const BIT_VALUE_POINTER: u8 = 1 << 1;
/// Earlier versions of this key can be discarded.
pub const BIT_DISCARD_EARLIER_VERSIONS: u8 = 1 << 2;

/// Length of the commit-timestamp suffix appended to every key.
pub const TIMESTAMP_SIZE: usize = 8;

/// A single mutation carried by the WAL or the value log.
///
/// Keys carry an 8-byte big-endian commit timestamp suffix which ties the
/// entries of one batch together across both log families.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entry {
    /// Key bytes, commit timestamp included.
    pub key: Vec<u8>,
    /// Value bytes. Empty for entries whose value lives in the LSM.
    pub value: Vec<u8>,
    /// Meta bitset (`BIT_TXN`, `BIT_FIN_TXN`, ...).
    pub meta: u8,
    /// Opaque byte owned by the layer above.
    pub user_meta: u8,
    /// Expiry as unix seconds; 0 means no expiry.
    pub expires_at: u64,
    /// Absolute offset of the record within its log file. Filled in during
    /// decoding.
    pub offset: u32,
    /// Encoded header length. Filled in during decoding.
    pub header_len: u32,
    /// When set, the write path emits an empty pointer and writes nothing.
    pub skip_vlog: bool,
}

impl Entry {
    /// Creates an entry with the given key and value.
    #[must_use]
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            ..Self::default()
        }
    }

    /// Whether the entry is part of a transaction batch.
    #[must_use]
    pub fn is_txn(&self) -> bool {
        self.meta & BIT_TXN != 0
    }

    /// Whether the entry terminates a transaction batch.
    #[must_use]
    pub fn is_fin_txn(&self) -> bool {
        self.meta & BIT_FIN_TXN != 0
    }
}

/// Appends the big-endian commit timestamp to a user key.
#[must_use]
pub fn key_with_ts(key: &[u8], ts: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + TIMESTAMP_SIZE);
    out.extend_from_slice(key);
    out.extend_from_slice(&ts.to_be_bytes());
    out
}

/// Extracts the commit timestamp from a key's suffix. Returns 0 for keys
/// too short to carry one.
#[must_use]
pub fn parse_ts(key: &[u8]) -> u64 {
    if key.len() < TIMESTAMP_SIZE {
        return 0;
    }
    let mut ts = [0u8; TIMESTAMP_SIZE];
    ts.copy_from_slice(&key[key.len() - TIMESTAMP_SIZE..]);
    u64::from_be_bytes(ts)
}

/// Address of a record in the value log, as stored in the LSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValuePointer {
    /// Value-log file id.
    pub fid: u32,
    /// Absolute offset of the record within the file.
    pub offset: u32,
    /// Full framed length of the record.
    pub len: u32,
}

impl ValuePointer {
    /// Whether this is the empty pointer emitted for WAL-resident entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fid == 0 && self.offset == 0 && self.len == 0
    }
}

/// An ordered batch of entries submitted to the log manager.
///
/// The last two entries are reserved end markers carrying `BIT_FIN_TXN` and
/// the batch's commit timestamp: one is appended to the WAL, the other to
/// the value log. They are what lets recovery match the two streams.
#[derive(Debug, Default)]
pub struct Request {
    /// Entries to persist, end markers included.
    pub entries: Vec<Entry>,
    /// One pointer per entry, filled in by the write path. Empty pointers
    /// stand for WAL-resident entries.
    pub ptrs: Vec<ValuePointer>,
}

impl Request {
    /// Creates a request from entries, end markers included.
    #[must_use]
    pub fn new(entries: Vec<Entry>) -> Self {
        Self {
            entries,
            ptrs: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_roundtrip() {
        let key = key_with_ts(b"answer", 42);
        assert_eq!(key.len(), 6 + TIMESTAMP_SIZE);
        assert_eq!(&key[..6], b"answer");
        assert_eq!(parse_ts(&key), 42);
    }

    #[test]
    fn short_key_has_no_timestamp() {
        assert_eq!(parse_ts(b"short"), 0);
        assert_eq!(parse_ts(b""), 0);
    }

    #[test]
    fn meta_bits() {
        let mut e = Entry::new(b"k".to_vec(), b"v".to_vec());
        assert!(!e.is_txn());
        assert!(!e.is_fin_txn());

        e.meta = BIT_TXN;
        assert!(e.is_txn());

        e.meta = BIT_FIN_TXN;
        assert!(e.is_fin_txn());
    }

    #[test]
    fn empty_pointer() {
        assert!(ValuePointer::default().is_empty());
        assert!(!ValuePointer {
            fid: 1,
            offset: 20,
            len: 30
        }
        .is_empty());
    }
}
