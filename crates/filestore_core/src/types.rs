//! Core type definitions for the log engine.

use crate::error::{CoreError, CoreResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between 1900-01-01 and the Unix epoch.
const EPOCH_1900_OFFSET_SECS: u64 = 2_208_988_800;

/// One minute expressed in the low 32 bits of a [`Tid`].
const MINUTE_FRACTION: f64 = 4_294_967_296.0 / 60.0;

/// Identifier of a stored object.
///
/// Object ids are caller-assigned 8-byte big-endian integers, so the raw
/// bytes sort the same way the numbers do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Oid(pub u64);

impl Oid {
    /// The root object, where reachability marking starts.
    pub const ROOT: Self = Self(0);

    /// Creates a new object id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the big-endian byte form.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Builds an id from its big-endian byte form.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid:{:016x}", self.0)
    }
}

/// Transaction id, doubling as the commit time stamp.
///
/// The high 32 bits count minutes since 1900-01-01 UTC; the low 32 bits
/// hold the position within that minute, in units of 60/2^32 seconds.
/// Serials written on data records are the `Tid` of the writing
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tid(pub u64);

impl Tid {
    /// The zero time stamp, older than every real transaction.
    pub const ZERO: Self = Self(0);

    /// The largest time stamp; used as the "no stop" scan bound.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a tid from its raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the big-endian byte form.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Builds a tid from its big-endian byte form.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    /// Converts Unix time in (fractional) seconds into a time stamp.
    #[must_use]
    pub fn from_unix_secs(secs: f64) -> Self {
        let since_1900 = secs.max(0.0) + EPOCH_1900_OFFSET_SECS as f64;
        let minutes = (since_1900 / 60.0).floor();
        let within = since_1900 - minutes * 60.0;
        let fraction = (within * MINUTE_FRACTION).min(u32::MAX as f64) as u64;
        Self(((minutes as u64) << 32) | fraction)
    }

    /// Converts a system time into a time stamp.
    #[must_use]
    pub fn from_system_time(time: SystemTime) -> Self {
        let secs = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self::from_unix_secs(secs)
    }

    /// The time stamp of the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Returns the current time stamp, or `prev + 1` if the clock has not
    /// moved past `prev`.
    #[must_use]
    pub fn later_than(prev: Self) -> Self {
        let now = Self::now();
        if now > prev {
            now
        } else {
            Self(prev.0.saturating_add(1))
        }
    }

    /// Converts back to Unix time in seconds.
    #[must_use]
    pub fn to_unix_secs(self) -> f64 {
        let minutes = (self.0 >> 32) as f64;
        let within = (self.0 & 0xffff_ffff) as f64 / MINUTE_FRACTION;
        minutes * 60.0 + within - EPOCH_1900_OFFSET_SECS as f64
    }

    /// Converts back to a system time.
    #[must_use]
    pub fn to_system_time(self) -> SystemTime {
        let secs = self.to_unix_secs();
        if secs <= 0.0 {
            UNIX_EPOCH
        } else {
            UNIX_EPOCH + Duration::from_secs_f64(secs)
        }
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid:{:016x}", self.0)
    }
}

/// Status byte of a transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Committed and valid (`' '`).
    Committed,
    /// Undone; its data records are never current (`'u'`).
    Undone,
    /// Rewritten by pack with a shorter body (`'p'`).
    Packed,
    /// Write in progress; seen only after a crash (`'c'`).
    Checkpoint,
}

impl TransactionStatus {
    /// Converts a byte to a status.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b' ' => Some(Self::Committed),
            b'u' => Some(Self::Undone),
            b'p' => Some(Self::Packed),
            b'c' => Some(Self::Checkpoint),
            _ => None,
        }
    }

    /// Converts the status to its on-disk byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Committed => b' ',
            Self::Undone => b'u',
            Self::Packed => b'p',
            Self::Checkpoint => b'c',
        }
    }
}

/// Opaque handle naming one transaction for undo.
///
/// Rendered as URL-safe unpadded base64 of `tid ++ offset`; callers pass the
/// string back verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UndoLocator {
    /// Transaction id.
    pub tid: Tid,
    /// File offset of the transaction record.
    pub offset: u64,
}

impl UndoLocator {
    /// Creates a locator.
    #[must_use]
    pub const fn new(tid: Tid, offset: u64) -> Self {
        Self { tid, offset }
    }

    /// Renders the printable token.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&self.tid.to_bytes());
        raw[8..].copy_from_slice(&self.offset.to_be_bytes());
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Parses a token produced by [`Self::encode`].
    ///
    /// # Errors
    ///
    /// Returns an `InvalidLocator` undo error if the token is not 16 bytes
    /// of base64.
    pub fn decode(token: &str) -> CoreResult<Self> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| CoreError::undo(crate::error::UndoRefusal::InvalidLocator))?;
        let raw: [u8; 16] = raw
            .try_into()
            .map_err(|_| CoreError::undo(crate::error::UndoRefusal::InvalidLocator))?;
        let mut tid = [0u8; 8];
        let mut offset = [0u8; 8];
        tid.copy_from_slice(&raw[..8]);
        offset.copy_from_slice(&raw[8..]);
        Ok(Self {
            tid: Tid::from_bytes(tid),
            offset: u64::from_be_bytes(offset),
        })
    }
}

impl fmt::Display for UndoLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
