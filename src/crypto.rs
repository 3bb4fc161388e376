//! Two-direction AES-256-GCM facade.
//!
//! A [`CipherPair`] binds one cipher context per direction at construction and
//! is the only place key material is retained after connection setup. Nonces
//! (IVs) are supplied by the caller: the packet layout guarantees uniqueness
//! through the segment number / message number discipline, which is why the
//! segment number generator is a hard correctness prerequisite.

use aead::{AeadInPlace, Nonce, Tag};
use aes_gcm::{Aes256Gcm, Key, KeyInit};

use crate::error::{Error, Result};
use crate::secret_key::SecretKey;

pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

pub struct CipherPair {
    seal: Aes256Gcm,
    open: Aes256Gcm,
}

impl CipherPair {
    /// Binds `encrypt_key` to the outgoing direction and `decrypt_key` to the
    /// incoming one.
    pub fn new(encrypt_key: &SecretKey, decrypt_key: &SecretKey) -> CipherPair {
        CipherPair {
            seal: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(encrypt_key.bytes())),
            open: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(decrypt_key.bytes())),
        }
    }

    /// Encrypts `plaintext`, writing ciphertext followed by the 16-byte tag
    /// into `dest[offset..offset + plaintext.len() + TAG_LEN]`.
    ///
    /// A failure of the GCM primitive itself is a fatal [`Error::Crypto`].
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        additional: &[u8],
        iv: &[u8; IV_LEN],
        dest: &mut [u8],
        offset: usize,
    ) -> Result<()> {
        let ciphertext_end = offset + plaintext.len();
        dest[offset..ciphertext_end].copy_from_slice(plaintext);

        let tag = self
            .seal
            .encrypt_in_place_detached(
                Nonce::<Aes256Gcm>::from_slice(iv),
                additional,
                &mut dest[offset..ciphertext_end],
            )
            .map_err(|_| Error::Crypto("AES-GCM encryption failed".to_string()))?;

        dest[ciphertext_end..ciphertext_end + TAG_LEN].copy_from_slice(&tag);
        Ok(())
    }

    /// Authenticates and decrypts `length` bytes (ciphertext ∥ tag) starting
    /// at `offset` in `buf`.
    ///
    /// Returns `(plaintext, true)` on success and `(empty, false)` when the
    /// tag does not verify. A bad tag is the expected outcome for forged or
    /// corrupted input and is *not* an error; callers drop the packet.
    pub fn decrypt(
        &self,
        buf: &[u8],
        additional: &[u8],
        iv: &[u8; IV_LEN],
        offset: usize,
        length: usize,
    ) -> (Vec<u8>, bool) {
        if length < TAG_LEN || offset + length > buf.len() {
            return (Vec::new(), false);
        }
        let ciphertext_end = offset + length - TAG_LEN;

        let mut plaintext = buf[offset..ciphertext_end].to_vec();
        let tag = Tag::<Aes256Gcm>::from_slice(&buf[ciphertext_end..offset + length]);

        match self.open.decrypt_in_place_detached(
            Nonce::<Aes256Gcm>::from_slice(iv),
            additional,
            &mut plaintext,
            tag,
        ) {
            Ok(()) => (plaintext, true),
            Err(_) => (Vec::new(), false),
        }
    }
}
