//! XMODEM / XMODEM-1K: the single-file member of the family, with no
//! filename packet and no batch termination.

use crate::channel::{self, CancelTracker, Channel};
use crate::error::{Error, Result};
use crate::packet::{self, control, BlockLength, Trailer};
use crate::progress::Progress;
use log::{debug, info, warn};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// Tuning knobs for an XMODEM transfer.
#[derive(Debug, Clone)]
pub struct XmodemConfig {
    /// Retries permitted per packet/handshake step before the transfer
    /// aborts with a two-CAN sequence.
    pub max_retries: u32,
    /// Use 1024-byte (`STX`) blocks instead of 128-byte (`SOH`) ones.
    pub use_1k: bool,
    /// How long the sender waits, in total, for the receiver's initial
    /// NAK/CRC_REQ.
    pub start_timeout: Duration,
}

impl Default for XmodemConfig {
    fn default() -> Self {
        XmodemConfig {
            max_retries: 10,
            use_1k: false,
            start_timeout: Duration::from_secs(60),
        }
    }
}

fn block_length(cfg: &XmodemConfig) -> BlockLength {
    if cfg.use_1k {
        BlockLength::Long
    } else {
        BlockLength::Short
    }
}

/// Sends `source` as a single XMODEM transfer over `chan`.
///
/// Returns `Ok(true)` on success, `Ok(false)` if the peer canceled or
/// the retry budget was exhausted (both are reported to the caller as
/// the protocol's terminal "failure" outcome); `Err` is reserved for
/// local I/O failures unrelated to the wire protocol.
pub fn send<C: Channel, R: Read>(
    chan: &mut C,
    source: &mut R,
    cfg: &XmodemConfig,
    mut progress: Option<&mut dyn Progress>,
) -> Result<bool> {
    let mut cancel = CancelTracker::default();
    let length = block_length(cfg);

    let trailer = match await_start(chan, &mut cancel, cfg.start_timeout) {
        Ok(t) => t,
        Err(Error::Canceled) => return Ok(false),
        Err(e) => return Err(e),
    };
    debug!("xmodem: start handshake complete, trailer={trailer:?}");

    let mut seq: u8 = 1;
    let mut sent: u64 = 0;
    let mut buf = vec![0u8; length.size()];
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let block = packet::build_data_block(length, seq, &buf[..n], trailer);
        match send_block_with_retry(chan, &mut cancel, &block, cfg.max_retries) {
            Ok(()) => {}
            Err(Error::Canceled) => return Ok(false),
            Err(Error::ExhaustedRetries) => {
                abort(chan);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        sent += n as u64;
        if let Some(p) = progress.as_deref_mut() {
            p.update(0, "", sent, sent);
        }
        seq = seq.wrapping_add(1);
    }

    match finish_send(chan, &mut cancel, cfg.max_retries) {
        Ok(()) => {
            info!("xmodem: transfer complete, {sent} bytes sent");
            Ok(true)
        }
        Err(Error::Canceled) => Ok(false),
        Err(Error::ExhaustedRetries) => {
            abort(chan);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Receives a single XMODEM transfer from `chan`, writing the decoded
/// payload to `dest`. `use_crc` selects whether the receiver requests
/// CRC16 (recommended) or the legacy checksum trailer.
pub fn recv<C: Channel, W: Write>(
    chan: &mut C,
    dest: &mut W,
    cfg: &XmodemConfig,
    use_crc: bool,
    mut progress: Option<&mut dyn Progress>,
) -> Result<bool> {
    let mut cancel = CancelTracker::default();
    let mut trailer = Trailer::from_crc_mode(use_crc);

    let mut pending_header = match poke_sender(chan, &mut cancel, &mut trailer, cfg.max_retries) {
        Ok(h) => Some(h),
        Err(Error::Canceled) => return Ok(false),
        Err(Error::ExhaustedRetries) => {
            abort(chan);
            return Ok(false);
        }
        Err(e) => return Err(e),
    };

    let mut expected_seq: u8 = 1;
    let mut received: u64 = 0;
    loop {
        let outcome = recv_one_block(
            chan,
            &mut cancel,
            trailer,
            expected_seq,
            cfg.max_retries,
            pending_header.take(),
        );
        match outcome {
            Ok(BlockOutcome::Eot) => {
                channel::write_all(chan, &[control::ACK])?;
                break;
            }
            Ok(BlockOutcome::Data(data)) => {
                dest.write_all(&data)?;
                received += data.len() as u64;
                if let Some(p) = progress.as_deref_mut() {
                    p.update(0, "", received, received);
                }
                expected_seq = expected_seq.wrapping_add(1);
            }
            Err(Error::Canceled) => return Ok(false),
            Err(Error::ExhaustedRetries) => {
                abort(chan);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
    }

    info!("xmodem: receive complete, {received} bytes received");
    Ok(true)
}

fn await_start<C: Channel>(
    chan: &mut C,
    cancel: &mut CancelTracker,
    max: Duration,
) -> Result<Trailer> {
    let deadline = Instant::now() + max;
    loop {
        if let Some(b) = channel::read_byte_timeout(chan)? {
            cancel.observe(b)?;
            match b {
                control::NAK => return Ok(Trailer::Checksum),
                control::CRC_REQ => return Ok(Trailer::Crc16),
                _ => warn!("xmodem: unexpected byte 0x{b:02X} while awaiting start"),
            }
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout("start handshake"));
        }
    }
}

fn send_block_with_retry<C: Channel>(
    chan: &mut C,
    cancel: &mut CancelTracker,
    block: &[u8],
    max_retries: u32,
) -> Result<()> {
    for _ in 0..max_retries {
        channel::write_all(chan, block)?;
        match channel::read_byte_timeout(chan)? {
            Some(control::ACK) => return Ok(()),
            Some(b) => {
                cancel.observe(b)?;
                debug!("xmodem: expected ACK, got 0x{b:02X}, retrying");
            }
            None => debug!("xmodem: timed out waiting for ACK, retrying"),
        }
    }
    Err(Error::ExhaustedRetries)
}

fn finish_send<C: Channel>(
    chan: &mut C,
    cancel: &mut CancelTracker,
    max_retries: u32,
) -> Result<()> {
    for _ in 0..max_retries {
        channel::write_all(chan, &[control::EOT])?;
        match channel::read_byte_timeout(chan)? {
            Some(control::ACK) => return Ok(()),
            Some(b) => {
                cancel.observe(b)?;
                debug!("xmodem: expected ACK for EOT, got 0x{b:02X}, resending EOT");
            }
            None => debug!("xmodem: timed out waiting for ACK of EOT, resending"),
        }
    }
    Err(Error::ExhaustedRetries)
}

/// Drives the receiver's poking loop: emits `CRC_REQ` for the first half
/// of the retry budget, then falls back to `NAK` (checksum mode) for the
/// rest, until a block header (`SOH`/`STX`) arrives. Returns that header
/// byte so the caller can feed it into the first call to
/// [`recv_one_block`] without losing it.
fn poke_sender<C: Channel>(
    chan: &mut C,
    cancel: &mut CancelTracker,
    trailer: &mut Trailer,
    max_retries: u32,
) -> Result<u8> {
    for attempt in 0..max_retries {
        let poke = if *trailer == Trailer::Crc16 && attempt < max_retries / 2 {
            control::CRC_REQ
        } else {
            *trailer = Trailer::Checksum;
            control::NAK
        };
        channel::write_all(chan, &[poke])?;
        if let Some(b) = channel::read_byte_timeout(chan)? {
            if BlockLength::from_header_byte(b).is_some() {
                return Ok(b);
            }
            cancel.observe(b)?;
        }
    }
    Err(Error::ExhaustedRetries)
}

enum BlockOutcome {
    Data(Vec<u8>),
    Eot,
}

fn recv_one_block<C: Channel>(
    chan: &mut C,
    cancel: &mut CancelTracker,
    trailer: Trailer,
    expected_seq: u8,
    max_retries: u32,
    mut pending_header: Option<u8>,
) -> Result<BlockOutcome> {
    for _ in 0..max_retries {
        let header = match pending_header.take() {
            Some(b) => b,
            None => match channel::read_byte_timeout(chan)? {
                Some(b) => b,
                None => {
                    channel::write_all(chan, &[control::NAK])?;
                    continue;
                }
            },
        };
        cancel.observe(header)?;

        if header == control::EOT {
            return Ok(BlockOutcome::Eot);
        }

        let Some(recv_length) = BlockLength::from_header_byte(header) else {
            channel::purge(chan);
            channel::write_all(chan, &[control::NAK])?;
            continue;
        };

        let seq = channel::read_byte(chan)?;
        let complement = channel::read_byte(chan)?;
        let body_len = recv_length.size() + trailer.len();

        if !packet::seq_complement_ok(seq, complement) {
            let mut drain = vec![0u8; body_len];
            let _ = channel::read_exact(chan, &mut drain);
            channel::write_all(chan, &[control::NAK])?;
            continue;
        }

        let mut body = vec![0u8; body_len];
        if channel::read_exact(chan, &mut body).is_err() {
            channel::purge(chan);
            channel::write_all(chan, &[control::NAK])?;
            continue;
        }

        let (payload, trailer_bytes) = body.split_at(recv_length.size());
        if !trailer.verify(payload, trailer_bytes) {
            channel::write_all(chan, &[control::NAK])?;
            continue;
        }

        if seq == expected_seq {
            channel::write_all(chan, &[control::ACK])?;
            return Ok(BlockOutcome::Data(payload.to_vec()));
        } else if seq == expected_seq.wrapping_sub(1) {
            // duplicate of the last accepted block: lost ACK, re-ack
            // without re-writing.
            channel::write_all(chan, &[control::ACK])?;
            continue;
        } else {
            channel::write_all(chan, &[control::NAK])?;
            continue;
        }
    }
    Err(Error::ExhaustedRetries)
}

fn abort<C: Channel>(chan: &mut C) {
    let _ = channel::write_all(chan, &[control::CAN, control::CAN]);
}
