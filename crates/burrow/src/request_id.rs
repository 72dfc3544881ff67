//! Per-request correlation identifiers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::TryRngCore;
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::error;

/// Size of the random part of a request ID, in bytes.
pub const REQUEST_ID_SIZE: usize = 8;

#[derive(Error, Debug)]
#[error("random source unavailable: {0}")]
pub struct RequestIdError(pub String);

/// 16-character lowercase hex token shared by a request's log entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type Fill = fn(&mut [u8; REQUEST_ID_SIZE]) -> Result<(), RequestIdError>;

fn fill_from_os(buf: &mut [u8; REQUEST_ID_SIZE]) -> Result<(), RequestIdError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|err| RequestIdError(err.to_string()))
}

/// Source of request IDs.
#[derive(Clone, Copy)]
pub struct RequestIds {
    fill: Fill,
}

impl fmt::Debug for RequestIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestIds").finish_non_exhaustive()
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::os()
    }
}

impl RequestIds {
    /// IDs drawn from the operating system's CSPRNG.
    pub fn os() -> Self {
        Self { fill: fill_from_os }
    }

    pub fn with_source(fill: Fill) -> Self {
        Self { fill }
    }

    /// Generate a random ID.
    pub fn generate(&self) -> Result<RequestId, RequestIdError> {
        let mut buf = [0u8; REQUEST_ID_SIZE];
        (self.fill)(&mut buf)?;
        Ok(RequestId(hex::encode(buf)))
    }

    /// Generate a random ID, or a clock-derived one if randomness is
    /// unavailable. Never fails.
    pub fn next(&self) -> RequestId {
        match self.generate() {
            Ok(id) => id,
            Err(err) => {
                error!(error = %err, "request id");
                fallback_id()
            }
        }
    }
}

/// Low-entropy ID from the wall clock, offset by a process-wide counter so
/// two fallbacks within one clock tick still differ.
pub fn fallback_id() -> RequestId {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);

    RequestId(format!("{:016x}", nanos.wrapping_add(seq)))
}
