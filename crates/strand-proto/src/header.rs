use crate::{
    Version, WireError, COMPRESSION_STATUS_OFFSET, HEADER_SIZE, MAGIC, MESSAGE_SIZE_OFFSET,
    PROTOCOL, PROTOCOL_ENCODING,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Request,
    RequestBatch,
    Reply,
    ValidateConnection,
    CloseConnection,
}

impl MessageType {
    pub fn tag(self) -> u8 {
        match self {
            MessageType::Request => 0,
            MessageType::RequestBatch => 1,
            MessageType::Reply => 2,
            MessageType::ValidateConnection => 3,
            MessageType::CloseConnection => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, WireError> {
        match tag {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::RequestBatch),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::ValidateConnection),
            4 => Ok(MessageType::CloseConnection),
            tag => Err(WireError::UnknownMessageType { tag }),
        }
    }

    /// Control messages carry no body.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            MessageType::ValidateConnection | MessageType::CloseConnection
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompressionStatus {
    /// The sender does not compress.
    NotCompressed,
    /// The sender supports compression but this message is not compressed.
    Uncompressed,
    Compressed,
}

impl CompressionStatus {
    pub fn byte(self) -> u8 {
        match self {
            CompressionStatus::NotCompressed => 0,
            CompressionStatus::Uncompressed => 1,
            CompressionStatus::Compressed => 2,
        }
    }

    pub fn from_byte(status: u8) -> Result<Self, WireError> {
        match status {
            0 => Ok(CompressionStatus::NotCompressed),
            1 => Ok(CompressionStatus::Uncompressed),
            2 => Ok(CompressionStatus::Compressed),
            status => Err(WireError::UnknownCompressionStatus { status }),
        }
    }
}

/// The fixed message preamble.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub protocol: Version,
    pub encoding: Version,
    pub message_type: MessageType,
    pub compression: CompressionStatus,
    /// Total message size, header included.
    pub size: usize,
}

impl Header {
    /// A header for a body-less message of the given type.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            protocol: PROTOCOL,
            encoding: PROTOCOL_ENCODING,
            message_type,
            compression: CompressionStatus::NotCompressed,
            size: HEADER_SIZE,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.write_into(&mut buf);
        buf
    }

    /// Serialize into the first `HEADER_SIZE` bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than `HEADER_SIZE`.
    pub fn write_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = self.protocol.major;
        buf[5] = self.protocol.minor;
        buf[6] = self.encoding.major;
        buf[7] = self.encoding.minor;
        buf[8] = self.message_type.tag();
        buf[COMPRESSION_STATUS_OFFSET] = self.compression.byte();
        let size = i32::try_from(self.size).unwrap_or(i32::MAX);
        buf[MESSAGE_SIZE_OFFSET..HEADER_SIZE].copy_from_slice(&size.to_le_bytes());
    }

    /// Parse and validate a header.
    ///
    /// Magic, versions and message type are checked before the declared size is trusted. The
    /// size must cover at least the header and must not exceed `message_size_max`.
    pub fn decode(buf: &[u8], message_size_max: usize) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::Truncated {
                needed: HEADER_SIZE,
                have: buf.len(),
            });
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(WireError::BadMagic { found: magic });
        }

        let protocol = Version::new(buf[4], buf[5]);
        if !protocol.is_supported_by(PROTOCOL) {
            return Err(WireError::UnsupportedProtocol {
                found: protocol,
                supported: PROTOCOL,
            });
        }

        let encoding = Version::new(buf[6], buf[7]);
        if !encoding.is_supported_by(PROTOCOL_ENCODING) {
            return Err(WireError::UnsupportedEncoding {
                found: encoding,
                supported: PROTOCOL_ENCODING,
            });
        }

        let message_type = MessageType::from_tag(buf[8])?;
        let compression = CompressionStatus::from_byte(buf[COMPRESSION_STATUS_OFFSET])?;

        let size = i32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]);
        if size < HEADER_SIZE as i32 {
            return Err(WireError::IllegalMessageSize { size: size.into() });
        }
        let size = size as usize;
        if size > message_size_max {
            return Err(WireError::MemoryLimit {
                size,
                max: message_size_max,
            });
        }

        Ok(Self {
            protocol,
            encoding,
            message_type,
            compression,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_MESSAGE_SIZE_MAX;

    fn header_bytes(message_type: u8, size: i32) -> [u8; HEADER_SIZE] {
        let mut buf = Header::new(MessageType::Request).encode();
        buf[8] = message_type;
        buf[MESSAGE_SIZE_OFFSET..].copy_from_slice(&size.to_le_bytes());
        buf
    }

    #[test]
    fn validate_connection_header_layout_is_stable() {
        let bytes = Header::new(MessageType::ValidateConnection).encode();
        assert_eq!(
            bytes,
            [0x49, 0x63, 0x65, 0x50, 1, 0, 1, 0, 3, 0, 14, 0, 0, 0]
        );
    }

    #[test]
    fn rejects_bad_magic_before_anything_else() {
        let mut buf = header_bytes(99, -5);
        buf[0] = b'X';
        let err = Header::decode(&buf, DEFAULT_MESSAGE_SIZE_MAX).unwrap_err();
        assert!(matches!(err, WireError::BadMagic { .. }));
    }

    #[test]
    fn rejects_newer_minor_and_other_major_versions() {
        let mut buf = header_bytes(0, 14);
        buf[5] = 1;
        assert!(matches!(
            Header::decode(&buf, DEFAULT_MESSAGE_SIZE_MAX),
            Err(WireError::UnsupportedProtocol { .. })
        ));

        let mut buf = header_bytes(0, 14);
        buf[6] = 2;
        assert!(matches!(
            Header::decode(&buf, DEFAULT_MESSAGE_SIZE_MAX),
            Err(WireError::UnsupportedEncoding { .. })
        ));
    }

    #[test]
    fn rejects_sizes_outside_bounds() {
        let buf = header_bytes(0, 13);
        assert_eq!(
            Header::decode(&buf, DEFAULT_MESSAGE_SIZE_MAX),
            Err(WireError::IllegalMessageSize { size: 13 })
        );

        let buf = header_bytes(0, -1);
        assert_eq!(
            Header::decode(&buf, DEFAULT_MESSAGE_SIZE_MAX),
            Err(WireError::IllegalMessageSize { size: -1 })
        );

        let buf = header_bytes(0, 4096);
        assert_eq!(
            Header::decode(&buf, 1024),
            Err(WireError::MemoryLimit {
                size: 4096,
                max: 1024
            })
        );
    }

    #[test]
    fn rejects_unknown_message_type() {
        let buf = header_bytes(9, 14);
        assert_eq!(
            Header::decode(&buf, DEFAULT_MESSAGE_SIZE_MAX),
            Err(WireError::UnknownMessageType { tag: 9 })
        );
    }

    #[test]
    fn short_buffer_is_reported_as_truncated() {
        let buf = Header::new(MessageType::Reply).encode();
        assert_eq!(
            Header::decode(&buf[..10], DEFAULT_MESSAGE_SIZE_MAX),
            Err(WireError::Truncated {
                needed: HEADER_SIZE,
                have: 10
            })
        );
    }
}
