//! Per-file transfer state and the YMODEM filename packet's optional
//! field encoding.

use crate::error::{Error, Result};
use crate::profile::FeatureFlags;
use std::time::{SystemTime, UNIX_EPOCH};

/// POSIX regular-file mode bit, written into the mode field on Unix
/// hosts per the YMODEM spec (a non-Unix host sends `0`).
pub const MODE_REGULAR_FILE: u32 = 0o100000;

/// Per-file transfer state, owned exclusively by whichever role (sender
/// or receiver) is driving the current file.
#[derive(Debug, Clone, Default)]
pub struct Task {
    /// Logical (basename) file name carried on the wire.
    pub name: String,
    /// Total size in bytes, known up front for the sender and parsed
    /// from the filename packet's length field for the receiver (0 if
    /// the length field is absent).
    pub total: u64,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: u64,
    /// POSIX file mode bits.
    pub mode: u32,
    /// Serial number field (0 if unknown/unused).
    pub sn: u32,
    /// Bytes actually read from the source stream so far (unpadded).
    pub sent: u64,
    /// Bytes written to the destination stream so far.
    pub received: u64,
    /// Count of data packets successfully acknowledged.
    pub success_packet_count: u64,
}

impl Task {
    /// Builds a `Task` for a file the sender is about to transmit.
    pub fn for_send(name: String, total: u64, mtime: u64, mode: u32) -> Self {
        Task {
            name,
            total,
            mtime,
            mode,
            ..Default::default()
        }
    }

    /// Current wall-clock time as seconds since the Unix epoch, used
    /// when no more precise mtime is available to the caller.
    pub fn now_epoch_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Encodes the YMODEM filename-packet payload (unpadded): the NUL
/// terminated name, followed by the optional fields enabled by
/// `features`, space-separated, in length/mtime/mode/sn order.
pub fn encode_name_fields(task: &Task, features: FeatureFlags) -> Vec<u8> {
    let mut out = task.name.as_bytes().to_vec();
    out.push(0);

    let mut parts: Vec<String> = Vec::new();
    if features.has(FeatureFlags::USE_LENGTH) {
        parts.push(task.total.to_string());
    }
    if features.has(FeatureFlags::USE_DATE) {
        parts.push(format!("{:o}", task.mtime));
    }
    if features.has(FeatureFlags::USE_MODE) {
        parts.push(format!("{:o}", task.mode));
    }
    if features.has(FeatureFlags::USE_SN) {
        parts.push(format!("{:o}", task.sn));
    }

    out.extend_from_slice(parts.join(" ").as_bytes());
    out
}

/// Decodes a filename-packet payload into a `Task`. Returns `Ok(None)`
/// for an empty name, which signals YMODEM batch end.
pub fn decode_name_fields(payload: &[u8], features: FeatureFlags) -> Result<Option<Task>> {
    let mut fields = payload.split(|&b| b == 0);
    let name = fields
        .next()
        .ok_or_else(|| Error::Protocol("empty filename packet".into()))?;
    if name.is_empty() {
        return Ok(None);
    }
    let name = String::from_utf8(name.to_vec())
        .map_err(|_| Error::Protocol("filename packet is not valid UTF-8".into()))?;

    let rest = fields.next().unwrap_or(&[]);
    let rest = std::str::from_utf8(rest)
        .map_err(|_| Error::Protocol("filename packet fields are not valid UTF-8".into()))?;

    let mut remaining = rest;
    let next_field = |remaining: &mut &str| -> Option<String> {
        if remaining.is_empty() {
            return None;
        }
        let (field, rest) = match remaining.find(' ') {
            Some(i) => (&remaining[..i], &remaining[i + 1..]),
            None => (*remaining, ""),
        };
        *remaining = rest;
        Some(field.to_string())
    };

    let mut task = Task {
        name,
        ..Default::default()
    };

    if features.has(FeatureFlags::USE_LENGTH) {
        if let Some(f) = next_field(&mut remaining) {
            task.total = f
                .parse()
                .map_err(|_| Error::Protocol(format!("invalid length field {f:?}")))?;
        }
    }
    if features.has(FeatureFlags::USE_DATE) {
        if let Some(f) = next_field(&mut remaining) {
            task.mtime = u64::from_str_radix(&f, 8)
                .map_err(|_| Error::Protocol(format!("invalid mtime field {f:?}")))?;
        }
    }
    if features.has(FeatureFlags::USE_MODE) {
        if let Some(f) = next_field(&mut remaining) {
            task.mode = u32::from_str_radix(&f, 8)
                .map_err(|_| Error::Protocol(format!("invalid mode field {f:?}")))?;
        }
    }
    if features.has(FeatureFlags::USE_SN) {
        if let Some(f) = next_field(&mut remaining) {
            task.sn = u32::from_str_radix(&f, 8)
                .map_err(|_| Error::Protocol(format!("invalid serial number field {f:?}")))?;
        }
    }

    Ok(Some(task))
}
