//! Cryptographic primitives for the log layer.
//!
//! Log records and registry blocks are protected with an AES-CTR keystream
//! XOR, so encryption and decryption are the same operation. Each log file
//! carries a random 16-byte base IV; the per-record IV is the base IV
//! interpreted as a big-endian counter plus the record's absolute offset,
//! which gives every record a unique counter block.

use crate::error::{Error, Result};
use aes::{Aes128, Aes192, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::RngCore;

/// Size of an initialization vector in bytes (one AES block).
pub const IV_SIZE: usize = 16;

type Aes128Ctr = Ctr128BE<Aes128>;
type Aes192Ctr = Ctr128BE<Aes192>;
type Aes256Ctr = Ctr128BE<Aes256>;

/// Generates a fresh random IV from the OS cryptographic source.
#[must_use]
pub fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Generates `len` bytes of random key material.
#[must_use]
pub fn generate_key(len: usize) -> Vec<u8> {
    let mut key = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Validates that `len` is a supported AES key size.
///
/// # Errors
///
/// Returns [`Error::InvalidKeySize`] for anything other than 16, 24 or 32.
pub fn validate_key_size(len: usize) -> Result<()> {
    match len {
        16 | 24 | 32 => Ok(()),
        actual => Err(Error::InvalidKeySize { actual }),
    }
}

/// XORs `data` in place with the AES-CTR keystream derived from `key` and
/// `iv`. Applying it twice with the same parameters restores the input.
///
/// # Errors
///
/// Returns [`Error::InvalidKeySize`] if `key` is not a supported AES key
/// size.
pub fn xor_stream(key: &[u8], iv: &[u8; IV_SIZE], data: &mut [u8]) -> Result<()> {
    match key.len() {
        16 => {
            let mut cipher = Aes128Ctr::new_from_slices(key, iv)
                .map_err(|_| Error::InvalidKeySize { actual: key.len() })?;
            cipher.apply_keystream(data);
        }
        24 => {
            let mut cipher = Aes192Ctr::new_from_slices(key, iv)
                .map_err(|_| Error::InvalidKeySize { actual: key.len() })?;
            cipher.apply_keystream(data);
        }
        32 => {
            let mut cipher = Aes256Ctr::new_from_slices(key, iv)
                .map_err(|_| Error::InvalidKeySize { actual: key.len() })?;
            cipher.apply_keystream(data);
        }
        actual => return Err(Error::InvalidKeySize { actual }),
    }
    Ok(())
}

/// Derives the per-record IV from a file's base IV and the record's
/// absolute offset within the file.
#[must_use]
pub fn record_iv(base_iv: &[u8; IV_SIZE], offset: u32) -> [u8; IV_SIZE] {
    let counter = u128::from_be_bytes(*base_iv).wrapping_add(u128::from(offset));
    counter.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ivs_differ() {
        assert_ne!(generate_iv(), generate_iv());
    }

    #[test]
    fn xor_stream_is_involutive() {
        let key = generate_key(16);
        let iv = generate_iv();
        let original = b"the quick brown fox jumps over the lazy dog".to_vec();

        let mut data = original.clone();
        xor_stream(&key, &iv, &mut data).unwrap();
        assert_ne!(data, original);

        xor_stream(&key, &iv, &mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn all_key_sizes_supported() {
        let iv = generate_iv();
        for len in [16, 24, 32] {
            let key = generate_key(len);
            let mut data = vec![0xAB; 64];
            xor_stream(&key, &iv, &mut data).unwrap();
            xor_stream(&key, &iv, &mut data).unwrap();
            assert_eq!(data, vec![0xAB; 64]);
        }
    }

    #[test]
    fn rejects_bad_key_sizes() {
        let iv = generate_iv();
        for len in [0, 8, 15, 17, 33, 64] {
            let key = vec![0u8; len];
            let mut data = [0u8; 8];
            assert!(matches!(
                xor_stream(&key, &iv, &mut data),
                Err(Error::InvalidKeySize { actual }) if actual == len
            ));
            assert!(validate_key_size(len).is_err());
        }
    }

    #[test]
    fn record_iv_advances_counter() {
        let base = [0u8; IV_SIZE];
        let iv = record_iv(&base, 20);
        assert_eq!(u128::from_be_bytes(iv), 20);

        // Offsets must map to distinct counter blocks.
        assert_ne!(record_iv(&base, 20), record_iv(&base, 21));
    }

    #[test]
    fn record_iv_wraps() {
        let base = [0xFF; IV_SIZE];
        let iv = record_iv(&base, 1);
        assert_eq!(u128::from_be_bytes(iv), 0);
    }

    #[test]
    fn different_offsets_give_different_ciphertext() {
        let key = generate_key(16);
        let base = generate_iv();

        let mut a = vec![0u8; 32];
        let mut b = vec![0u8; 32];
        xor_stream(&key, &record_iv(&base, 20), &mut a).unwrap();
        xor_stream(&key, &record_iv(&base, 52), &mut b).unwrap();
        assert_ne!(a, b);
    }
}
