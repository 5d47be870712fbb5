//! On-disk record framing.
//!
//! ## Record format
//!
//! ```text
//! | header | key (klen) | value (vlen) | crc32c (4, big-endian) |
//! ```
//!
//! The header is `meta (1) | user_meta (1) | klen uvarint | vlen uvarint |
//! expires_at uvarint`. When the file carries a data key, the `key|value`
//! region is XOR-streamed under the per-record IV; the header stays plain so
//! framing can be parsed before decryption, and the CRC covers the bytes as
//! they appear on disk.

use crate::crypto::{self, IV_SIZE};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::registry::DataKey;

/// Size of the trailing checksum.
pub const CRC_SIZE: usize = 4;

/// Upper bound on the encoded header length:
/// meta (1) + user_meta (1) + two u32 uvarints (5 each) + one u64 uvarint (10).
pub const MAX_HEADER_SIZE: usize = 22;

/// Encryption context of a log file: its data key and base IV.
pub type Crypt<'a> = (&'a DataKey, &'a [u8; IV_SIZE]);

pub(crate) fn encode_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

pub(crate) fn decode_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Key length in bytes.
    pub klen: u32,
    /// Value length in bytes.
    pub vlen: u32,
    /// Expiry as unix seconds; 0 means no expiry.
    pub expires_at: u64,
    /// Meta bitset.
    pub meta: u8,
    /// Opaque byte owned by the layer above.
    pub user_meta: u8,
}

impl Header {
    /// Appends the encoded header to `buf` and returns its length.
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        let start = buf.len();
        buf.push(self.meta);
        buf.push(self.user_meta);
        encode_uvarint(buf, u64::from(self.klen));
        encode_uvarint(buf, u64::from(self.vlen));
        encode_uvarint(buf, self.expires_at);
        buf.len() - start
    }

    /// Decodes a header from the front of `buf`, returning it together with
    /// its encoded length.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Truncate`] when `buf` ends before the header does or
    /// a length field overflows `u32`.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 3 {
            return Err(Error::Truncate);
        }
        let meta = buf[0];
        let user_meta = buf[1];
        let mut pos = 2;

        let (klen, n) = decode_uvarint(&buf[pos..]).ok_or(Error::Truncate)?;
        pos += n;
        let (vlen, n) = decode_uvarint(&buf[pos..]).ok_or(Error::Truncate)?;
        pos += n;
        let (expires_at, n) = decode_uvarint(&buf[pos..]).ok_or(Error::Truncate)?;
        pos += n;

        let klen = u32::try_from(klen).map_err(|_| Error::Truncate)?;
        let vlen = u32::try_from(vlen).map_err(|_| Error::Truncate)?;

        Ok((
            Self {
                klen,
                vlen,
                expires_at,
                meta,
                user_meta,
            },
            pos,
        ))
    }
}

/// Appends the framed record for `entry` to `buf` and returns the number of
/// bytes written.
///
/// `entry_offset` is the absolute offset the record will occupy in its log
/// file; it derives the per-record IV when `crypt` is set.
///
/// # Errors
///
/// Returns an error if the key or value length does not fit the header, or
/// if the data key has an unsupported size.
pub fn encode_entry(
    entry: &Entry,
    buf: &mut Vec<u8>,
    entry_offset: u32,
    crypt: Option<Crypt<'_>>,
) -> Result<usize> {
    let klen = u32::try_from(entry.key.len())
        .map_err(|_| Error::invalid_argument("key too large for log record"))?;
    let vlen = u32::try_from(entry.value.len())
        .map_err(|_| Error::invalid_argument("value too large for log record"))?;

    let header = Header {
        klen,
        vlen,
        expires_at: entry.expires_at,
        meta: entry.meta,
        user_meta: entry.user_meta,
    };

    let start = buf.len();
    let header_len = header.encode(buf);
    buf.extend_from_slice(&entry.key);
    buf.extend_from_slice(&entry.value);

    if let Some((data_key, base_iv)) = crypt {
        let iv = crypto::record_iv(base_iv, entry_offset);
        crypto::xor_stream(&data_key.data, &iv, &mut buf[start + header_len..])?;
    }

    let crc = crc32c::crc32c(&buf[start..]);
    buf.extend_from_slice(&crc.to_be_bytes());

    Ok(buf.len() - start)
}

/// Validates the framed record at the front of `buf` without decrypting
/// it: parses the header and checks the trailing checksum over the bytes
/// as stored. Returns the header and its encoded length.
///
/// `buf` may extend past the record.
///
/// # Errors
///
/// - [`Error::Eof`] when `buf` is empty (clean end of log)
/// - [`Error::Truncate`] when the frame extends past `buf` or the checksum
///   does not match
pub fn check_frame(buf: &[u8]) -> Result<(Header, usize)> {
    if buf.is_empty() {
        return Err(Error::Eof);
    }

    let (header, header_len) = Header::decode(buf)?;
    let total = header_len + header.klen as usize + header.vlen as usize + CRC_SIZE;
    if buf.len() < total {
        return Err(Error::Truncate);
    }

    let mut crc_bytes = [0u8; CRC_SIZE];
    crc_bytes.copy_from_slice(&buf[total - CRC_SIZE..total]);
    let stored_crc = u32::from_be_bytes(crc_bytes);
    let computed_crc = crc32c::crc32c(&buf[..total - CRC_SIZE]);
    if stored_crc != computed_crc {
        return Err(Error::Truncate);
    }
    Ok((header, header_len))
}

/// Decodes one framed record from the front of `buf`, returning the entry
/// and the number of bytes consumed.
///
/// `buf` may extend past the record; only the framed length is consumed.
///
/// # Errors
///
/// Propagates [`check_frame`] failures.
pub fn decode_entry(
    buf: &[u8],
    entry_offset: u32,
    crypt: Option<Crypt<'_>>,
) -> Result<(Entry, usize)> {
    let (header, header_len) = check_frame(buf)?;
    let klen = header.klen as usize;
    let vlen = header.vlen as usize;
    let total = header_len + klen + vlen + CRC_SIZE;

    let mut kv = buf[header_len..header_len + klen + vlen].to_vec();
    if let Some((data_key, base_iv)) = crypt {
        let iv = crypto::record_iv(base_iv, entry_offset);
        crypto::xor_stream(&data_key.data, &iv, &mut kv)?;
    }
    let value = kv.split_off(klen);

    Ok((
        Entry {
            key: kv,
            value,
            meta: header.meta,
            user_meta: header.user_meta,
            expires_at: header.expires_at,
            offset: entry_offset,
            header_len: header_len as u32,
            skip_vlog: false,
        },
        total,
    ))
}
