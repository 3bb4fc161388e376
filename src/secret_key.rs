//! Owner type for 32-byte pre-shared and derived keys.
//!
//! Key bytes live in exactly one place at a time; storage is zeroed when the
//! owner is dropped. Copies are never implicit: there is no `Clone`, only an
//! explicit [`SecretKey::duplicate`], and the duplicate scrubs itself on drop
//! just like the original. Hex parsing writes each nibble straight into the
//! key array so no intermediate buffer ever holds key material.

use std::fmt::{Debug, Formatter};

use zeroize::Zeroize;

use crate::error::{Error, Result};

pub const SECRET_KEY_LEN: usize = 32;

pub struct SecretKey {
    key: [u8; SECRET_KEY_LEN],
}

impl SecretKey {
    pub fn from_bytes(bytes: [u8; SECRET_KEY_LEN]) -> SecretKey {
        SecretKey { key: bytes }
    }

    /// Parses a key from its 64-hex-digit representation.
    pub fn from_hex(s: &str) -> Result<SecretKey> {
        if s.len() != 2 * SECRET_KEY_LEN {
            return Err(Error::Config(format!(
                "key string has length {}, expected {}",
                s.len(),
                2 * SECRET_KEY_LEN
            )));
        }

        let raw = s.as_bytes();
        let mut key = SecretKey {
            key: [0u8; SECRET_KEY_LEN],
        };
        for i in 0..SECRET_KEY_LEN {
            let hi = hex_nibble(raw[2 * i]);
            let lo = hex_nibble(raw[2 * i + 1]);
            match (hi, lo) {
                (Some(hi), Some(lo)) => key.key[i] = (hi << 4) | lo,
                _ => {
                    // key drops here, zeroing the partially parsed bytes
                    return Err(Error::Config("invalid hex digit in key".to_string()));
                }
            }
        }
        Ok(key)
    }

    pub fn bytes(&self) -> &[u8; SECRET_KEY_LEN] {
        &self.key
    }

    /// Explicit copy. The returned key is an independent owner and is scrubbed
    /// on drop like any other.
    pub fn duplicate(&self) -> SecretKey {
        SecretKey { key: self.key }
    }
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl Debug for SecretKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // never print key material
        write!(f, "SecretKey(..)")
    }
}
