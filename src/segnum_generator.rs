//! Persistent segment number generator.
//!
//! Segment numbers are the AES-GCM nonce prefix, so a number must never be
//! handed out twice by a host, across all runs and all restarts. The
//! generator combines the wall clock with an on-disk ceiling of every number
//! that may already have been handed out, so neither a clock rollback nor a
//! crash can cause reuse.
//!
//! The ceiling is stored twice, in `<base>_FIRST` and `<base>_SECOND`. Each
//! file holds two identical lines of decimal digits (optionally followed by
//! strictly empty lines). On a reservation the ceiling is written fully to
//! `_FIRST` before `_SECOND` is touched, so a crash mid-update leaves at
//! least one valid file; reading takes the maximum of the two. The files are
//! never created by the generator itself: installation must seed at least one
//! of them, which keeps a lost record loud instead of silently restarting the
//! number space.

use std::cmp::max;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::epoch::epoch_millis;
use crate::error::{Error, Result};
use crate::packet_header::SEGNUM_MAX;

pub const FIRST_FILE_SUFFIX: &str = "_FIRST";
pub const SECOND_FILE_SUFFIX: &str = "_SECOND";

struct GeneratorState {
    /// The next number to hand out.
    next: u64,
    /// Handing out this number requires a fresh reservation first.
    reserve_limit: u64,
    /// How many numbers to reserve per disk round-trip.
    reservation_size: u64,
}

pub struct SegnumGenerator {
    first_path: PathBuf,
    second_path: PathBuf,
    state: Mutex<GeneratorState>,
}

impl SegnumGenerator {
    /// `base_path` is the stem of the two record files; `reservation_size`
    /// is how many numbers each disk round-trip reserves (tune it to roughly
    /// twice the number of connections so that rollovers rarely touch disk).
    pub fn new(base_path: impl AsRef<Path>, reservation_size: u64) -> Result<SegnumGenerator> {
        if reservation_size == 0 {
            return Err(Error::Config(
                "segment number reservation size must be at least 1".to_string(),
            ));
        }

        let base = base_path.as_ref().to_path_buf();
        Ok(SegnumGenerator {
            first_path: path_with_suffix(&base, FIRST_FILE_SUFFIX),
            second_path: path_with_suffix(&base, SECOND_FILE_SUFFIX),
            // next == reserve_limit forces a reservation on the first call,
            // which leaves room to call set_reservation_size() before any
            // disk traffic happens
            state: Mutex::new(GeneratorState {
                next: 1,
                reserve_limit: 1,
                reservation_size,
            }),
        })
    }

    /// Returns a fresh segment number, reserving a new range from disk when
    /// the current one is exhausted. Thread-safe; calls are serialised.
    pub fn next(&self) -> Result<u64> {
        let mut state = self.state.lock().expect("segnum generator lock poisoned");

        if state.next == state.reserve_limit {
            self.reserve(&mut state)?;
        }

        let num = state.next;
        state.next += 1;
        Ok(num)
    }

    /// Sets how many numbers to reserve per disk round-trip.
    pub fn set_reservation_size(&self, reservation_size: u64) -> Result<()> {
        if reservation_size == 0 {
            return Err(Error::Config(
                "segment number reservation size must be at least 1".to_string(),
            ));
        }
        self.state
            .lock()
            .expect("segnum generator lock poisoned")
            .reservation_size = reservation_size;
        Ok(())
    }

    /// Reserves a fresh range of numbers: reads the stored ceiling, samples a
    /// strictly increased wall clock, and persists the new ceiling to both
    /// files before any number of the range is handed out.
    fn reserve(&self, state: &mut GeneratorState) -> Result<()> {
        let saved = max(
            read_saved(&self.first_path),
            read_saved(&self.second_path),
        );
        if saved == 0 {
            return Err(Error::Persistence(format!(
                "no valid segment number record in {} or {}",
                self.first_path.display(),
                self.second_path.display()
            )));
        }

        let clock = strictly_increased_clock()?;

        state.next = max(saved + 1, clock);
        let reserve_limit = state.next + state.reservation_size;
        if reserve_limit > SEGNUM_MAX {
            return Err(Error::Persistence(
                "segment number space exhausted".to_string(),
            ));
        }
        state.reserve_limit = reserve_limit;

        // _FIRST is completely written and verified before _SECOND is touched
        write_saved(&self.first_path, reserve_limit - 1)?;
        write_saved(&self.second_path, reserve_limit - 1)?;
        Ok(())
    }
}

fn path_with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut path = base.as_os_str().to_os_string();
    path.push(suffix);
    PathBuf::from(path)
}

/// Reads one record file. Anything unusable (missing file, bad digits,
/// whitespace, mismatched or extra lines, a single-line record, or a value
/// at or beyond the segment number maximum) yields 0, leaving the decision
/// to the other file.
fn read_saved(path: &Path) -> u64 {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            debug!("could not read segment number file {}: {}", path.display(), e);
            return 0;
        }
    };

    match parse_record(&content) {
        Some(value) => value,
        None => {
            warn!("segment number file {} is malformed", path.display());
            0
        }
    }
}

fn parse_record(content: &str) -> Option<u64> {
    let mut lines = content.split('\n');
    let first = lines.next()?;
    let second = lines.next()?;

    if first.is_empty()
        || first != second
        || !first.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    if lines.any(|rest| !rest.is_empty()) {
        return None;
    }

    let value = first.parse::<u64>().ok()?;
    if value >= SEGNUM_MAX {
        // a previous run can have stored at most SEGNUM_MAX - 1
        return None;
    }
    Some(value)
}

/// Writes `value` to `path` as the two-line record and verifies it by reading
/// back, retrying every 100 ms until the file round-trips. A write failure is
/// fatal; only a readback mismatch retries.
fn write_saved(path: &Path, value: u64) -> Result<()> {
    let record = format!("{}\n{}", value, value);
    loop {
        fs::write(path, &record).map_err(|e| {
            Error::Persistence(format!(
                "could not write segment number file {}: {}",
                path.display(),
                e
            ))
        })?;

        if parse_record(&fs::read_to_string(path).unwrap_or_default()) == Some(value) {
            return Ok(());
        }

        warn!(
            "segment number file {} did not read back correctly, retrying",
            path.display()
        );
        thread::sleep(Duration::from_millis(100));
    }
}

/// Samples the wall clock (millis since epoch) and busy-waits in 1 ms sleeps
/// until the reading strictly increases, guaranteeing a value that no earlier
/// run can have sampled.
fn strictly_increased_clock() -> Result<u64> {
    let base = epoch_millis();
    let mut clock = base;
    while clock == base {
        thread::sleep(Duration::from_millis(1));
        clock = epoch_millis();
    }

    if clock > SEGNUM_MAX {
        // not reachable before the year 10000; sanity check on the clock
        return Err(Error::Persistence(
            "system clock reading is implausibly large".to_string(),
        ));
    }
    Ok(clock)
}
