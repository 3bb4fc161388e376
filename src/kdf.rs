//! Key derivation: HKDF-Expand over SHA-256.
//!
//! Only the expand step is used. The pre-shared secret two peers are
//! configured with is required to be chosen with cryptographic randomness,
//! which makes the extract step unnecessary; expand with per-direction info
//! strings then yields independent keys for the two directions of a channel.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::ids::{ChannelId, HostId, CHANNEL_ID_LEN, HOST_ID_LEN};
use crate::secret_key::{SecretKey, SECRET_KEY_LEN};

/// HKDF-Expand(secret, info) truncated to 32 bytes.
pub fn hkdf_expand(secret: &SecretKey, info: &[u8]) -> SecretKey {
    let hk = Hkdf::<Sha256>::from_prk(secret.bytes())
        .expect("a 32-byte key is always a valid SHA-256 PRK");

    let mut okm = [0u8; SECRET_KEY_LEN];
    hk.expand(info, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");

    let key = SecretKey::from_bytes(okm);
    okm.zeroize();
    key
}

/// Derives the two direction keys for a channel.
///
/// The send key uses info `self_id ∥ peer_id ∥ channel_id`, the receive key
/// `peer_id ∥ self_id ∥ channel_id`. The peer computes the same two keys with
/// its roles swapped, so each direction gets a distinct key from the one
/// shared secret.
pub fn derive_direction_keys(
    shared: &SecretKey,
    self_id: HostId,
    peer_id: HostId,
    channel_id: ChannelId,
) -> (SecretKey, SecretKey) {
    const INFO_LEN: usize = 2 * HOST_ID_LEN + CHANNEL_ID_LEN;

    let mut info = [0u8; INFO_LEN];
    info[..HOST_ID_LEN].copy_from_slice(self_id.as_bytes());
    info[HOST_ID_LEN..2 * HOST_ID_LEN].copy_from_slice(peer_id.as_bytes());
    info[2 * HOST_ID_LEN..].copy_from_slice(channel_id.as_bytes());
    let send_key = hkdf_expand(shared, &info);

    info[..HOST_ID_LEN].copy_from_slice(peer_id.as_bytes());
    info[HOST_ID_LEN..2 * HOST_ID_LEN].copy_from_slice(self_id.as_bytes());
    let recv_key = hkdf_expand(shared, &info);

    (send_key, recv_key)
}
