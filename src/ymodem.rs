//! YMODEM / YMODEM-1K / YMODEM-G: the batch member of the family, with
//! a leading filename packet per file and a batch-termination packet
//! at the end.

use crate::channel::{self, CancelTracker, Channel};
use crate::error::{Error, Result};
use crate::packet::{self, control, BlockLength, Trailer};
use crate::profile::ProgramProfile;
use crate::progress::Progress;
use crate::task::{self, Task};
use log::{debug, info, warn};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// Tuning knobs for a YMODEM transfer.
#[derive(Debug, Clone)]
pub struct YmodemConfig {
    /// Retries permitted per step before aborting with two CANs.
    pub max_retries: u32,
    /// Which named program style's feature set to honor.
    pub profile: ProgramProfile,
    /// Request 1024-byte blocks (downgraded to 128 if the profile
    /// doesn't allow it).
    pub request_1k: bool,
    /// Negotiate YMODEM-G streaming if the profile allows it.
    pub streaming: bool,
    /// Aggregate deadline for the very first start handshake.
    pub start_timeout: Duration,
}

impl Default for YmodemConfig {
    fn default() -> Self {
        YmodemConfig {
            max_retries: 10,
            profile: ProgramProfile::RzSz,
            request_1k: true,
            streaming: false,
            start_timeout: Duration::from_secs(60),
        }
    }
}

/// A file the sender will transmit: its metadata plus the open stream
/// to read its bytes from. Opening/closing the underlying stream is the
/// caller's responsibility; the filesystem is kept out of the protocol
/// core entirely.
pub struct FileSource<'a> {
    /// Metadata carried in the filename packet.
    pub task: Task,
    /// Readable stream positioned at the start of the file.
    pub reader: &'a mut dyn Read,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum NegotiatedMode {
    Checksum,
    Crc,
    Streaming,
}

impl NegotiatedMode {
    fn trailer(self) -> Trailer {
        match self {
            NegotiatedMode::Checksum => Trailer::Checksum,
            NegotiatedMode::Crc | NegotiatedMode::Streaming => Trailer::Crc16,
        }
    }
}

/// Sends every file in `files` as one YMODEM batch over `chan`.
pub fn send<C: Channel>(
    chan: &mut C,
    files: &mut [FileSource<'_>],
    cfg: &YmodemConfig,
    mut progress: Option<&mut dyn Progress>,
) -> Result<bool> {
    let mut cancel = CancelTracker::default();
    let features = cfg.profile.features();
    let length = cfg.profile.resolve_block_length(cfg.request_1k);

    let mut mode = match await_poke(chan, &mut cancel, cfg.streaming, cfg.start_timeout) {
        Ok(m) => m,
        Err(Error::Canceled) => return Ok(false),
        Err(Error::ExhaustedRetries) => {
            abort(chan);
            return Ok(false);
        }
        Err(e) => return Err(e),
    };

    let total_files = files.len();
    for (index, file) in files.iter_mut().enumerate() {
        if index > 0 && mode != NegotiatedMode::Streaming {
            mode = match await_poke(chan, &mut cancel, cfg.streaming, Duration::from_secs(10)) {
                Ok(m) => m,
                Err(Error::Canceled) => return Ok(false),
                Err(Error::ExhaustedRetries) => {
                    abort(chan);
                    return Ok(false);
                }
                Err(e) => return Err(e),
            };
        }
        let trailer = mode.trailer();

        let name_payload = task::encode_name_fields(&file.task, features);
        let block = packet::build_name_block(length, &name_payload, trailer);
        if mode == NegotiatedMode::Streaming {
            channel::write_all(chan, &block)?;
        } else {
            match send_block_with_retry(chan, &mut cancel, &block, cfg.max_retries) {
                Ok(()) => {}
                Err(Error::Canceled) => return Ok(false),
                Err(Error::ExhaustedRetries) => {
                    abort(chan);
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
            mode = match await_poke(chan, &mut cancel, cfg.streaming, Duration::from_secs(10)) {
                Ok(m) => m,
                Err(Error::Canceled) => return Ok(false),
                Err(Error::ExhaustedRetries) => {
                    abort(chan);
                    return Ok(false);
                }
                Err(e) => return Err(e),
            };
        }
        let trailer = mode.trailer();

        let mut seq: u8 = 1;
        let mut sent: u64 = 0;
        let mut buf = vec![0u8; length.size()];
        loop {
            let n = file.reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let block = packet::build_data_block(length, seq, &buf[..n], trailer);
            if mode == NegotiatedMode::Streaming {
                channel::write_all(chan, &block)?;
                if let Some(b) = channel::read_byte_timeout(chan)? {
                    cancel.observe(b)?;
                    if b != control::ACK {
                        warn!("ymodem-g: unexpected byte 0x{b:02X} while streaming");
                    }
                }
            } else {
                match send_block_with_retry(chan, &mut cancel, &block, cfg.max_retries) {
                    Ok(()) => {}
                    Err(Error::Canceled) => return Ok(false),
                    Err(Error::ExhaustedRetries) => {
                        abort(chan);
                        return Ok(false);
                    }
                    Err(e) => return Err(e),
                }
            }
            sent += n as u64;
            file.task.sent = sent;
            if let Some(p) = progress.as_deref_mut() {
                p.update(index as u32, &file.task.name, file.task.total, sent);
            }
            seq = seq.wrapping_add(1);
        }

        match finish_send(chan, &mut cancel, cfg.max_retries) {
            Ok(()) => {}
            Err(Error::Canceled) => return Ok(false),
            Err(Error::ExhaustedRetries) => {
                abort(chan);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        debug!(
            "ymodem: {} of {} - {} complete ({sent} bytes)",
            index + 1,
            total_files,
            file.task.name
        );
    }

    let batch_end = packet::build_name_block(length, &[], mode.trailer());
    channel::write_all(chan, &batch_end)?;
    info!("ymodem: batch end sent, {} file(s)", files.len());
    Ok(true)
}

/// Receives a YMODEM batch from `chan`. For each incoming filename
/// packet, `open` is called with the parsed [`Task`] to obtain a
/// destination stream; an `Err` from `open` aborts the whole transfer
/// with a two-CAN sequence.
pub fn recv<C: Channel>(
    chan: &mut C,
    cfg: &YmodemConfig,
    mut open: impl FnMut(&Task) -> Result<Box<dyn Write>>,
    mut progress: Option<&mut dyn Progress>,
) -> Result<bool> {
    let mut cancel = CancelTracker::default();
    let features = cfg.profile.features();
    let mut trailer = Trailer::Crc16;
    let mut task_index: i64 = -1;

    loop {
        let pending_header =
            match poke_sender(chan, &mut cancel, &mut trailer, cfg.max_retries, cfg.streaming) {
                Ok(h) => h,
                Err(Error::Canceled) => return Ok(false),
                Err(Error::ExhaustedRetries) => {
                    abort(chan);
                    return Ok(false);
                }
                Err(e) => return Err(e),
            };

        let name_outcome = recv_name_block(
            chan,
            &mut cancel,
            trailer,
            cfg.max_retries,
            Some(pending_header),
            features,
        );
        let mut task = match name_outcome {
            Ok(Some(task)) => task,
            Ok(None) => {
                channel::write_all(chan, &[control::ACK])?;
                info!("ymodem: received batch end after {} file(s)", task_index + 1);
                return Ok(true);
            }
            Err(Error::Canceled) => return Ok(false),
            Err(Error::ExhaustedRetries) => {
                abort(chan);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        task_index += 1;

        let mut dest = match open(&task) {
            Ok(d) => d,
            Err(e) => {
                warn!("ymodem: failed to open destination for {}: {e}", task.name);
                abort(chan);
                return Ok(false);
            }
        };

        let mut received: u64 = 0;
        let mut pending: Option<u8> = None;
        loop {
            let outcome = recv_data_block(chan, &mut cancel, trailer, &task, cfg.max_retries, pending.take());
            match outcome {
                Ok(BlockOutcome::Eot) => {
                    channel::write_all(chan, &[control::ACK])?;
                    break;
                }
                Ok(BlockOutcome::Data(data)) => {
                    let trimmed = if features.has(crate::profile::FeatureFlags::USE_LENGTH) && task.total > 0 {
                        let remaining = task.total.saturating_sub(received) as usize;
                        &data[..data.len().min(remaining)]
                    } else {
                        &data[..]
                    };
                    dest.write_all(trimmed)?;
                    received += trimmed.len() as u64;
                    task.success_packet_count += 1;
                    if let Some(p) = progress.as_deref_mut() {
                        p.update(task_index as u32, &task.name, task.total, received);
                    }
                }
                Err(Error::Canceled) => return Ok(false),
                Err(Error::ExhaustedRetries) => {
                    abort(chan);
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
        dest.flush()?;
        info!("ymodem: {} - {} complete ({received} bytes)", task_index + 1, task.name);
    }
}

fn await_poke<C: Channel>(
    chan: &mut C,
    cancel: &mut CancelTracker,
    allow_streaming: bool,
    max: Duration,
) -> Result<NegotiatedMode> {
    let deadline = Instant::now() + max;
    loop {
        if let Some(b) = channel::read_byte_timeout(chan)? {
            cancel.observe(b)?;
            match b {
                control::NAK => return Ok(NegotiatedMode::Checksum),
                control::CRC_REQ => return Ok(NegotiatedMode::Crc),
                control::G_REQ if allow_streaming => return Ok(NegotiatedMode::Streaming),
                _ => warn!("ymodem: unexpected byte 0x{b:02X} while awaiting poke"),
            }
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout("handshake"));
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
                debug!("ymodem: expected ACK, got 0x{b:02X}, retrying");
            }
            None => debug!("ymodem: timed out waiting for ACK, retrying"),
        }
    }
    Err(Error::ExhaustedRetries)
}

fn finish_send<C: Channel>(chan: &mut C, cancel: &mut CancelTracker, max_retries: u32) -> Result<()> {
    for _ in 0..max_retries {
        channel::write_all(chan, &[control::EOT])?;
        match channel::read_byte_timeout(chan)? {
            Some(control::ACK) => return Ok(()),
            Some(b) => {
                cancel.observe(b)?;
                debug!("ymodem: expected ACK for EOT, got 0x{b:02X}, resending EOT");
            }
            None => debug!("ymodem: timed out waiting for ACK of EOT, resending"),
        }
    }
    Err(Error::ExhaustedRetries)
}

/// Receiver-side poking loop: emits `CRC_REQ`/`G_REQ` for the first half
/// of the retry budget, then falls back to `NAK`.
fn poke_sender<C: Channel>(
    chan: &mut C,
    cancel: &mut CancelTracker,
    trailer: &mut Trailer,
    max_retries: u32,
    streaming: bool,
) -> Result<u8> {
    for attempt in 0..max_retries {
        let poke = if *trailer == Trailer::Crc16 && attempt < max_retries / 2 {
            if streaming {
                control::G_REQ
            } else {
                control::CRC_REQ
            }
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

fn recv_name_block<C: Channel>(
    chan: &mut C,
    cancel: &mut CancelTracker,
    trailer: Trailer,
    max_retries: u32,
    mut pending_header: Option<u8>,
    features: crate::profile::FeatureFlags,
) -> Result<Option<Task>> {
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

        let Some(length) = BlockLength::from_header_byte(header) else {
            channel::purge(chan);
            channel::write_all(chan, &[control::NAK])?;
            continue;
        };

        let seq = channel::read_byte(chan)?;
        let complement = channel::read_byte(chan)?;
        let body_len = length.size() + trailer.len();

        if seq != 0 || !packet::seq_complement_ok(seq, complement) {
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
        let (payload, trailer_bytes) = body.split_at(length.size());
        if !trailer.verify(payload, trailer_bytes) {
            channel::write_all(chan, &[control::NAK])?;
            continue;
        }

        return match task::decode_name_fields(payload, features) {
            Ok(Some(t)) => {
                channel::write_all(chan, &[control::ACK])?;
                Ok(Some(t))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
    }
    Err(Error::ExhaustedRetries)
}

enum BlockOutcome {
    Data(Vec<u8>),
    Eot,
}

fn recv_data_block<C: Channel>(
    chan: &mut C,
    cancel: &mut CancelTracker,
    trailer: Trailer,
    task: &Task,
    max_retries: u32,
    mut pending_header: Option<u8>,
) -> Result<BlockOutcome> {
    let last_accepted = task.success_packet_count as u8;
    let expected_seq = last_accepted.wrapping_add(1);
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

        let Some(length) = BlockLength::from_header_byte(header) else {
            channel::purge(chan);
            channel::write_all(chan, &[control::NAK])?;
            continue;
        };

        let seq = channel::read_byte(chan)?;
        let complement = channel::read_byte(chan)?;
        let body_len = length.size() + trailer.len();

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
        let (payload, trailer_bytes) = body.split_at(length.size());
        if !trailer.verify(payload, trailer_bytes) {
            channel::write_all(chan, &[control::NAK])?;
            continue;
        }

        if seq == expected_seq {
            channel::write_all(chan, &[control::ACK])?;
            return Ok(BlockOutcome::Data(payload.to_vec()));
        } else if seq == last_accepted {
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
