//! The byte-oriented, bidirectional transport the protocol core runs over.
//!
//! Any type that implements [`Read`] and [`Write`] and honors its own
//! read timeout (as `serialport::SerialPort` and the loopback pipes used
//! in the test suite both do, by returning
//! [`io::ErrorKind::TimedOut`](std::io::ErrorKind::TimedOut) when no byte
//! arrives in time) can be driven as a [`Channel`]. The state machines
//! never block longer than the deadlines documented on each function
//! here; enforcing the underlying per-call deadline is the transport's
//! job.

use crate::error::{Error, Result};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// A blanket marker for any transport the protocol core can drive.
pub trait Channel: Read + Write {}
impl<T: Read + Write + ?Sized> Channel for T {}

/// Tracks consecutive CAN bytes observed anywhere in a session; two in
/// a row is a graceful abort request from the peer.
#[derive(Default)]
pub(crate) struct CancelTracker(u32);

impl CancelTracker {
    /// Folds `byte` into the tracker; returns `Err(Error::Canceled)` once
    /// two CANs have been seen back to back, otherwise `Ok(())`.
    pub(crate) fn observe(&mut self, byte: u8) -> Result<()> {
        if byte == crate::packet::control::CAN {
            self.0 += 1;
            if self.0 >= 2 {
                return Err(Error::Canceled);
            }
        } else {
            self.0 = 0;
        }
        Ok(())
    }
}

/// Reads exactly one byte, translating a transport timeout into
/// [`Error::Timeout`] instead of propagating the raw I/O error.
pub fn read_byte<C: Channel + ?Sized>(chan: &mut C) -> Result<u8> {
    let mut buf = [0u8; 1];
    match chan.read_exact(&mut buf) {
        Ok(()) => Ok(buf[0]),
        Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(Error::Timeout("byte")),
        Err(e) => Err(Error::Io(e)),
    }
}

/// As [`read_byte`], but turns a timeout into `Ok(None)` rather than an
/// error, for call sites that treat "nothing arrived" as just another
/// loop iteration.
pub fn read_byte_timeout<C: Channel + ?Sized>(chan: &mut C) -> Result<Option<u8>> {
    match read_byte(chan) {
        Ok(b) => Ok(Some(b)),
        Err(Error::Timeout(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Reads exactly `buf.len()` bytes within the transport's configured
/// timeout, translating a timeout into [`Error::Timeout`].
pub fn read_exact<C: Channel + ?Sized>(chan: &mut C, buf: &mut [u8]) -> Result<()> {
    match chan.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(Error::Timeout("block")),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Writes exactly `data` to the channel.
pub fn write_all<C: Channel + ?Sized>(chan: &mut C, data: &[u8]) -> Result<()> {
    chan.write_all(data)?;
    chan.flush()?;
    Ok(())
}

/// Reads and discards bytes until the transport times out with nothing
/// buffered. Used before requesting retransmission so a late or
/// duplicated packet already in flight doesn't get misread as the start
/// of the next one.
pub fn purge<C: Channel + ?Sized>(chan: &mut C) {
    let mut scratch = [0u8; 1];
    loop {
        match chan.read_exact(&mut scratch) {
            Ok(()) => continue,
            Err(_) => return,
        }
    }
}

/// Polls single bytes until one of `expected` arrives or `max` elapses,
/// returning the matching byte.
pub fn read_and_wait<C: Channel + ?Sized>(chan: &mut C, expected: &[u8], max: Duration) -> Result<u8> {
    let deadline = Instant::now() + max;
    loop {
        if let Some(b) = read_byte_timeout(chan)? {
            if expected.contains(&b) {
                return Ok(b);
            }
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout("expected control byte"));
        }
    }
}

/// Writes a single byte, then waits as [`read_and_wait`] does.
pub fn write_and_wait<C: Channel + ?Sized>(
    chan: &mut C,
    byte: u8,
    expected: &[u8],
    max: Duration,
) -> Result<u8> {
    write_all(chan, &[byte])?;
    read_and_wait(chan, expected, max)
}
