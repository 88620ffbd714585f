//! An implementation of the XMODEM/YMODEM family of file-transfer
//! protocols: XMODEM, XMODEM-1K, YMODEM, YMODEM-1K, and YMODEM-G.
//!
//! The core is transport-agnostic: it drives any [`channel::Channel`]
//! (anything that is [`std::io::Read`] + [`std::io::Write`] and honors
//! its own read timeout) and never touches the filesystem directly.
//! [`xmodem`] covers the single-file variants; [`ymodem`] covers the
//! batch variants including streaming YMODEM-G.

pub mod channel;
pub mod crc;
pub mod error;
pub mod packet;
pub mod profile;
pub mod progress;
pub mod task;
pub mod xmodem;
pub mod ymodem;

pub use channel::Channel;
pub use error::{Error, Result};
pub use profile::{FeatureFlags, ProgramProfile};
pub use progress::Progress;
pub use task::Task;
pub use xmodem::XmodemConfig;
pub use ymodem::{FileSource, YmodemConfig};
