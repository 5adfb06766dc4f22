//! Base58 text form for key material.
//!
//! Key files and allowlists store 32-byte keys as one Base58 string per
//! line. This module wraps the `bs58` crate for that purpose.

use thiserror::Error;

pub use bs58::decode::Error as DecodeError;

/// Length in bytes of every public or secret key.
pub const KEY_LEN: usize = 32;

/// Errors that can occur when decoding a Base58-encoded key.
///
/// # Examples
///
/// ```
/// use rhizo_common::base58;
/// let short = base58::encode(&[1u8; 16]);
/// assert!(base58::decode_key(&short).is_err());
/// ```
#[derive(Debug, Error)]
pub enum KeyDecodeError {
    /// The input is not valid Base58.
    #[error("invalid base58: {0}")]
    Base58(#[from] DecodeError),
    /// The decoded bytes are not exactly [`KEY_LEN`] bytes.
    #[error("key must be exactly 32 bytes, got {0}")]
    WrongLength(usize),
}

/// Encodes raw bytes to a Base58 string.
#[must_use]
pub fn encode(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

/// Decodes a Base58 string to raw bytes.
///
/// # Errors
///
/// Returns `DecodeError` if the input is not valid Base58.
pub fn decode(s: &str) -> Result<Vec<u8>, DecodeError> {
    bs58::decode(s).into_vec()
}

/// Decodes a Base58 string to a 32-byte key, ignoring surrounding
/// whitespace.
///
/// # Errors
///
/// Returns [`KeyDecodeError`] if the input is not valid Base58
/// or does not decode to exactly 32 bytes.
///
/// # Examples
///
/// ```
/// let key = [0x42u8; 32];
/// let encoded = rhizo_common::base58::encode(&key);
/// let decoded = rhizo_common::base58::decode_key(&format!("{encoded}\n")).unwrap();
/// assert_eq!(decoded, key);
/// ```
pub fn decode_key(s: &str) -> Result<[u8; KEY_LEN], KeyDecodeError> {
    let bytes = decode(s.trim())?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_: Vec<u8>| KeyDecodeError::WrongLength(len))
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn key_text_roundtrip(key in any::<[u8; 32]>()) {
            let text = encode(&key);
            prop_assert_eq!(decode_key(&text).unwrap(), key);
            prop_assert_eq!(encode(&decode_key(&text).unwrap()), text);
        }
    }
}
