//! Local byte-stream endpoints, backed by named pipes.
//!
//! Each connection owns two FIFOs: `<base>_OUTWARD` carries bytes from the
//! local producer into the transport, `<base>_INWARD` carries received bytes
//! out to the local consumer. Both are opened read-write: holding our own
//! far end open means user-side open/close cycles never leave the pipe in a
//! state where readiness polling reports HUP or reads report EOF.
//!
//! All reads and writes are non-blocking. Writes are best-effort: when the
//! consumer stops draining and the pipe fills up, the tail of the write is
//! dropped (this is a datagram transport; backpressure to the remote sender
//! is out of scope).

use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use futures::FutureExt;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tokio::net::unix::pipe;
use tracing::debug;

use crate::error::{Error, Result};

pub const FROM_USER_SUFFIX: &str = "_OUTWARD";
pub const TO_USER_SUFFIX: &str = "_INWARD";

/// Creates a FIFO at `path` if nothing is there yet; an existing file must
/// already be a FIFO.
fn ensure_fifo(path: &Path) -> Result<()> {
    match fs::metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let mode = Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH;
            mkfifo(path, mode).map_err(|e| Error::Io(io::Error::from(e)))?;
            Ok(())
        }
        Err(e) => Err(e.into()),
        Ok(meta) if meta.file_type().is_fifo() => Ok(()),
        Ok(_) => Err(Error::Config(format!(
            "{} exists and is not a FIFO",
            path.display()
        ))),
    }
}

/// The `<base>_OUTWARD` endpoint: the transport's read side of the pipe the
/// local producer writes into.
pub struct FromUserFifo {
    path: PathBuf,
    receiver: pipe::Receiver,
}

impl FromUserFifo {
    pub fn open(base_path: &str) -> Result<FromUserFifo> {
        let path = PathBuf::from(format!("{}{}", base_path, FROM_USER_SUFFIX));
        ensure_fifo(&path)?;

        let receiver = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&path)?;
        Ok(FromUserFifo { path, receiver })
    }

    /// Reads up to `count` bytes without blocking, draining whatever is
    /// currently in the pipe.
    pub fn read_up_to(&self, count: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count];
        let mut total = 0;
        while total < count {
            match self.receiver.try_read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(Error::Io(io::Error::new(
                        e.kind(),
                        format!("reading from {}: {}", self.path.display(), e),
                    )))
                }
            }
        }
        buf.truncate(total);
        Ok(buf)
    }

    /// Whether the pipe currently looks readable. May report a false
    /// positive; callers treat it as a hint, not a promise of bytes.
    pub fn has_pending(&self) -> bool {
        self.receiver
            .readable()
            .now_or_never()
            .is_some_and(|ready| ready.is_ok())
    }

    /// Resolves once the pipe becomes readable. Used by the endpoint monitor
    /// to wake idle connections.
    pub async fn readable(&self) -> io::Result<()> {
        self.receiver.readable().await
    }
}

/// The `<base>_INWARD` endpoint: the transport's write side of the pipe the
/// local consumer reads from.
pub struct ToUserFifo {
    path: PathBuf,
    sender: pipe::Sender,
}

impl ToUserFifo {
    pub fn open(base_path: &str) -> Result<ToUserFifo> {
        let path = PathBuf::from(format!("{}{}", base_path, TO_USER_SUFFIX));
        ensure_fifo(&path)?;

        let sender = pipe::OpenOptions::new()
            .read_write(true)
            .open_sender(&path)?;
        Ok(ToUserFifo { path, sender })
    }

    /// Writes as much of `data` as fits without blocking and returns how many
    /// bytes made it. A full pipe drops the tail.
    pub fn write_best_effort(&self, data: &[u8]) -> Result<usize> {
        let mut total = 0;
        while total < data.len() {
            match self.sender.try_write(&data[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    debug!(
                        "pipe {} is full, dropping {} bytes",
                        self.path.display(),
                        data.len() - total
                    );
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!(
                        "pipe {} has no reader, dropping {} bytes",
                        self.path.display(),
                        data.len() - total
                    );
                    break;
                }
                Err(e) => {
                    return Err(Error::Io(io::Error::new(
                        e.kind(),
                        format!("writing to {}: {}", self.path.display(), e),
                    )))
                }
            }
        }
        Ok(total)
    }
}
