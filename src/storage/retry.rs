//! Interruption-tolerant reads over an unreliable backend.
//!
//! Object stores drop long-lived download connections. [`ResumableReader`] hides that from
//! its caller: when the underlying stream errors it is closed, a fresh one is opened at the
//! first byte the caller has not yet seen, and reading continues. Every byte of the logical
//! stream is delivered exactly once no matter how many times the physical stream was
//! replaced.
//!
//! The number of failed attempts is bounded by a [`RetryPolicy`] shared across the whole
//! read, so a flapping backend eventually surfaces as [`RetriesExhausted`] instead of
//! retrying forever.
use std::{
    io::{self, Read},
    thread,
    time::Duration,
};

use log::{debug, error};
use thiserror::Error;

use super::{ObjectStream, StorageError};

pub const DEFAULT_RETRY_LIMIT: usize = 100;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Bounds how hard a [`ResumableReader`] tries to reacquire a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts allowed over the lifetime of one read.
    pub limit: usize,
    /// Pause after a failed reopen.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: DEFAULT_RETRY_LIMIT,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(limit: usize, backoff: Duration) -> Self {
        Self { limit, backoff }
    }

    fn pause(&self) {
        if !self.backoff.is_zero() {
            thread::sleep(self.backoff);
        }
    }
}

/// Terminal failure of a [`ResumableReader`]. Carried inside the [`io::Error`] returned
/// from [`Read::read`].
#[derive(Debug, Clone, Copy, Error)]
#[error("failed to read object within {attempts} retries (offset reached {offset})")]
pub struct RetriesExhausted {
    pub attempts: usize,
    pub offset: i64,
}

/// A [`Read`] adapter that reopens its source at the last delivered offset on failure.
pub struct ResumableReader<F>
where
    F: FnMut(i64) -> Result<ObjectStream, StorageError>,
{
    reacquire: F,
    current: Option<ObjectStream>,
    start: i64,
    consumed: i64,
    retries: usize,
    policy: RetryPolicy,
}

impl<F> ResumableReader<F>
where
    F: FnMut(i64) -> Result<ObjectStream, StorageError>,
{
    /// Creates a reader that opens streams through `reacquire`, beginning at `start`.
    /// Nothing is opened until the first read.
    pub fn new(start: i64, policy: RetryPolicy, reacquire: F) -> Self {
        Self {
            reacquire,
            current: None,
            start,
            consumed: 0,
            retries: 0,
            policy,
        }
    }

    /// Bytes delivered to the caller so far.
    pub fn consumed(&self) -> i64 {
        self.consumed
    }

    /// Failed attempts so far.
    pub fn retries(&self) -> usize {
        self.retries
    }

    fn offset(&self) -> i64 {
        self.start + self.consumed
    }
}

impl<F> Read for ResumableReader<F>
where
    F: FnMut(i64) -> Result<ObjectStream, StorageError>,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.retries < self.policy.limit {
            if self.current.is_none() {
                let offset = self.offset();
                match (self.reacquire)(offset) {
                    Ok(stream) => {
                        debug!("acquired object stream at offset {}", self.offset());
                        self.current = Some(stream);
                    }
                    Err(e) => {
                        error!(
                            "failed to reacquire storage stream, wait and retry: {e} (offset reached {}, retry count {})",
                            self.offset(),
                            self.retries
                        );
                        self.retries += 1;
                        self.policy.pause();
                        continue;
                    }
                }
            }

            let Some(stream) = self.current.as_mut() else {
                continue;
            };
            match stream.read(buf) {
                Ok(n) => {
                    self.consumed += n as i64;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(
                        "encountered read error: {e} (offset reached {}, retry count {})",
                        self.offset(),
                        self.retries
                    );
                    // Close the broken stream before a replacement is opened.
                    self.current = None;
                    self.retries += 1;
                }
            }
        }

        Err(io::Error::other(RetriesExhausted {
            attempts: self.retries,
            offset: self.offset(),
        }))
    }
}
