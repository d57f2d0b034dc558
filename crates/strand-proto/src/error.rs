use crate::Version;

/// Failures raised while framing or unframing a message.
///
/// Every variant except `Truncated` is fatal to a stream-oriented connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("bad magic: {found:02x?}")]
    BadMagic { found: [u8; 4] },

    #[error("unsupported protocol version {found} (supported: {supported})")]
    UnsupportedProtocol { found: Version, supported: Version },

    #[error("unsupported protocol encoding {found} (supported: {supported})")]
    UnsupportedEncoding { found: Version, supported: Version },

    #[error("illegal message size: {size}")]
    IllegalMessageSize { size: i64 },

    #[error("message size {size} exceeds the maximum of {max} bytes")]
    MemoryLimit { size: usize, max: usize },

    #[error("unknown message type: {tag}")]
    UnknownMessageType { tag: u8 },

    #[error("unknown compression status: {status}")]
    UnknownCompressionStatus { status: u8 },

    #[error("feature unavailable: {feature}")]
    FeatureUnavailable { feature: &'static str },

    #[error("datagram truncated: declared {declared} bytes, received {received}")]
    DatagramTruncated { declared: usize, received: usize },

    #[error("buffer underflow: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("negative size: {size}")]
    NegativeSize { size: i32 },

    #[error("compression failed: {message}")]
    Compression { message: String },

    #[error("decompression failed: {message}")]
    Decompression { message: String },

    #[error("invalid utf-8 string: {message}")]
    InvalidString { message: String },
}
