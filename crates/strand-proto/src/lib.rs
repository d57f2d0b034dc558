//! Wire-level framing for the strand RPC protocol.
//!
//! Every message starts with a fixed 14-byte header:
//!
//! ```text
//! magic[4] | proto major | proto minor | enc major | enc minor | type | compression | size[4]
//! ```
//!
//! All multi-byte integers are little-endian. `size` is the total message size, header
//! included. This crate implements:
//! - header encoding/validation with strict size checks before any allocation
//! - the compact size encoding (1 byte below 255, otherwise `0xFF` + 4 bytes)
//! - optional payload compression (feature: `zstd`)
//! - message-level input/output streams used by the connection layer

mod compress;
mod error;
mod frame;
mod header;
mod reply;
mod stream;

pub use compress::{clamp_compression_level, compression_available};
pub use error::WireError;
pub use frame::{decode_body, decode_message, Frame};
pub use header::{CompressionStatus, Header, MessageType};
pub use reply::{encode_error_reply, ReplyStatus};
pub use stream::{decode_size, encode_size, encoded_size_len, InputStream, OutputStream};

/// Protocol magic, the first four bytes of every message.
pub const MAGIC: [u8; 4] = [0x49, 0x63, 0x65, 0x50];

/// Length of the fixed message header.
pub const HEADER_SIZE: usize = 14;

/// Offset of the compression-status byte inside the header.
pub const COMPRESSION_STATUS_OFFSET: usize = 9;

/// Offset of the total-size field inside the header.
pub const MESSAGE_SIZE_OFFSET: usize = 10;

/// Messages smaller than this are never compressed.
pub const COMPRESSION_THRESHOLD: usize = 100;

/// Default upper bound for a single message, header included.
pub const DEFAULT_MESSAGE_SIZE_MAX: usize = 1024 * 1024; // 1 MiB

/// Largest value the size codec (and the header size field) can represent.
pub const MAX_SIZE: usize = i32::MAX as usize;

/// Request id used for one-way requests (no reply expected).
pub const ONEWAY_REQUEST_ID: i32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// A peer version is usable when the major versions match and the peer's minor version
    /// does not exceed ours.
    pub fn is_supported_by(&self, local: Version) -> bool {
        self.major == local.major && self.minor <= local.minor
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Protocol version spoken by this implementation.
pub const PROTOCOL: Version = Version::new(1, 0);

/// Protocol encoding version spoken by this implementation.
pub const PROTOCOL_ENCODING: Version = Version::new(1, 0);
