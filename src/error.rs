use thiserror::Error;

/// Fatal error kinds surfaced by the transport.
///
/// Adversarial wire input (forged tags, replays, stale or malformed packets)
/// is deliberately *not* represented here: those are expected events, absorbed
/// silently where they occur. An AEAD authentication failure is reported as a
/// `tag_ok = false` value, never as an `Error`.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration: bad key length, bad port, bad counts.
    /// Fatal at construction time.
    #[error("configuration error: {0}")]
    Config(String),

    /// The persistent segment number record is unusable, or cannot be
    /// updated. Fatal: handing out segment numbers without a durable ceiling
    /// would risk AES-GCM nonce reuse.
    #[error("segment number persistence error: {0}")]
    Persistence(String),

    /// An encryption primitive failed. Only ever produced on the encryption
    /// path; decryption failures are value-level outcomes.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// I/O failure while setting up or using a local endpoint or socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
