//! Per-program feature profiles: which optional filename-packet fields
//! and block-size options a given sending program is known to support.

/// A bitfield over the YMODEM filename-packet fields and block-size
/// options a given sending program is known to support.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FeatureFlags(u8);

impl FeatureFlags {
    /// Include the decimal file-length field.
    pub const USE_LENGTH: u8 = 0b10_0000;
    /// Include the octal mtime field.
    pub const USE_DATE: u8 = 0b01_0000;
    /// Include the octal mode field.
    pub const USE_MODE: u8 = 0b00_1000;
    /// Include the octal serial-number field.
    pub const USE_SN: u8 = 0b00_0100;
    /// Allow negotiating 1024-byte (`STX`) blocks.
    pub const ALLOW_1K: u8 = 0b00_0010;
    /// Allow negotiating YMODEM-G (streaming, no per-packet ACK).
    pub const ALLOW_YMODEM_G: u8 = 0b00_0001;

    const fn new(bits: u8) -> Self {
        FeatureFlags(bits)
    }

    /// Returns `true` if every bit set in `mask` is also set here.
    pub fn has(self, mask: u8) -> bool {
        self.0 & mask == mask
    }
}

/// Five named sending-program styles, each with a fixed [`FeatureFlags`]
/// value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProgramProfile {
    /// Unix `rz`/`sz`: length, date, mode, 1k.
    RzSz,
    /// VMS `rb`/`sb`: length, 1k.
    RbSb,
    /// Pro-YAM: length, date, S/N, 1k, YMODEM-G.
    ProYam,
    /// CP/M YAM: 1k only.
    CpmYam,
    /// KMD/IMP: 1k only.
    KmdImp,
}

impl ProgramProfile {
    /// The feature set fixed for this profile.
    ///
    /// `ALLOW_YMODEM_G` never appears without `ALLOW_1K` across these
    /// five profiles.
    pub fn features(self) -> FeatureFlags {
        use FeatureFlags as F;
        match self {
            ProgramProfile::RzSz => F::new(F::USE_LENGTH | F::USE_DATE | F::USE_MODE | F::ALLOW_1K),
            ProgramProfile::RbSb => F::new(F::USE_LENGTH | F::ALLOW_1K),
            ProgramProfile::ProYam => {
                F::new(F::USE_LENGTH | F::USE_DATE | F::USE_SN | F::ALLOW_1K | F::ALLOW_YMODEM_G)
            }
            ProgramProfile::CpmYam => F::new(F::ALLOW_1K),
            ProgramProfile::KmdImp => F::new(F::ALLOW_1K),
        }
    }

    /// Resolves the effective block length for a requested size, given
    /// this profile's features: downgrades 1024 to 128 when the profile
    /// does not allow 1k blocks.
    pub fn resolve_block_length(self, requested_1k: bool) -> crate::packet::BlockLength {
        if requested_1k && self.features().has(FeatureFlags::ALLOW_1K) {
            crate::packet::BlockLength::Long
        } else {
            crate::packet::BlockLength::Short
        }
    }
}
