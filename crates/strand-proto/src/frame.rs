use std::borrow::Cow;

use crate::compress::{compress, decompress_with_limit};
use crate::{
    compression_available, CompressionStatus, Header, MessageType, WireError,
    COMPRESSION_STATUS_OFFSET, COMPRESSION_THRESHOLD, HEADER_SIZE, MAX_SIZE, MESSAGE_SIZE_OFFSET,
};

const REQUEST_ID_OFFSET: usize = HEADER_SIZE;

/// An outgoing message: an owned head (header plus the fixed preamble such as the request id
/// or batch count) followed by a body that may still borrow the caller's buffer.
///
/// The header's size and compression fields are only meaningful after [`Frame::prepare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<'a> {
    message_type: MessageType,
    head: Vec<u8>,
    body: Cow<'a, [u8]>,
}

impl<'a> Frame<'a> {
    fn with_preamble(message_type: MessageType, preamble: Option<i32>, body: Cow<'a, [u8]>) -> Self {
        let mut head = Vec::with_capacity(HEADER_SIZE + 4);
        head.extend_from_slice(&Header::new(message_type).encode());
        if let Some(v) = preamble {
            head.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            message_type,
            head,
            body,
        }
    }

    /// A request with the given id (0 for one-way).
    pub fn request(request_id: i32, payload: impl Into<Cow<'a, [u8]>>) -> Self {
        Self::with_preamble(MessageType::Request, Some(request_id), payload.into())
    }

    /// `count` one-way requests, concatenated.
    pub fn batch(count: i32, payloads: impl Into<Cow<'a, [u8]>>) -> Self {
        Self::with_preamble(MessageType::RequestBatch, Some(count), payloads.into())
    }

    pub fn reply(request_id: i32, payload: impl Into<Cow<'a, [u8]>>) -> Self {
        Self::with_preamble(MessageType::Reply, Some(request_id), payload.into())
    }

    /// A body-less validate or close message.
    pub fn control(message_type: MessageType) -> Frame<'static> {
        debug_assert!(message_type.is_control());
        Frame::with_preamble(message_type, None, Cow::Borrowed(&[]))
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Request id of a request or reply frame.
    pub fn request_id(&self) -> Option<i32> {
        match self.message_type {
            MessageType::Request | MessageType::Reply if !self.is_compressed() => {
                let b = &self.head[REQUEST_ID_OFFSET..REQUEST_ID_OFFSET + 4];
                Some(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            }
            _ => None,
        }
    }

    /// Patch the request id of a request frame that has not been prepared yet.
    pub fn set_request_id(&mut self, request_id: i32) {
        debug_assert_eq!(self.message_type, MessageType::Request);
        debug_assert!(!self.is_compressed());
        self.head[REQUEST_ID_OFFSET..REQUEST_ID_OFFSET + 4]
            .copy_from_slice(&request_id.to_le_bytes());
    }

    pub fn compression(&self) -> CompressionStatus {
        CompressionStatus::from_byte(self.head[COMPRESSION_STATUS_OFFSET])
            .unwrap_or(CompressionStatus::NotCompressed)
    }

    fn is_compressed(&self) -> bool {
        self.head[COMPRESSION_STATUS_OFFSET] == CompressionStatus::Compressed.byte()
    }

    /// Total size on the wire.
    pub fn len(&self) -> usize {
        self.head.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finalize the frame: optionally compress, then back-patch the compression status and the
    /// total size into the header.
    ///
    /// Compression is applied only when `compress` is set, the build has a compressor, the
    /// message is at least [`COMPRESSION_THRESHOLD`] bytes and the result is smaller.
    pub fn prepare(&mut self, compress_requested: bool, level: i32) -> Result<(), WireError> {
        let total = self.len();
        if total > MAX_SIZE {
            return Err(WireError::MemoryLimit {
                size: total,
                max: MAX_SIZE,
            });
        }

        let mut status = CompressionStatus::NotCompressed;
        if compress_requested && compression_available() {
            status = CompressionStatus::Uncompressed;
            if total >= COMPRESSION_THRESHOLD {
                let mut uncompressed = Vec::with_capacity(total - HEADER_SIZE);
                uncompressed.extend_from_slice(&self.head[HEADER_SIZE..]);
                uncompressed.extend_from_slice(&self.body);
                let compressed = compress(&uncompressed, level)?;
                if HEADER_SIZE + 4 + compressed.len() < total {
                    self.head.truncate(HEADER_SIZE);
                    self.head.extend_from_slice(&(total as i32).to_le_bytes());
                    self.body = Cow::Owned(compressed);
                    status = CompressionStatus::Compressed;
                } else {
                    tracing::trace!(
                        target = "strand.proto",
                        size = total,
                        compressed = compressed.len(),
                        "compression did not shrink the message; sending it uncompressed"
                    );
                }
            }
        }

        self.head[COMPRESSION_STATUS_OFFSET] = status.byte();
        let size = self.len() as i32;
        self.head[MESSAGE_SIZE_OFFSET..HEADER_SIZE].copy_from_slice(&size.to_le_bytes());
        Ok(())
    }

    /// The next contiguous bytes to write, given that `written` bytes already went out.
    pub fn chunk(&self, written: usize) -> &[u8] {
        if written < self.head.len() {
            &self.head[written..]
        } else {
            let offset = (written - self.head.len()).min(self.body.len());
            &self.body[offset..]
        }
    }

    /// Copy any borrowed body so the frame can outlive the caller's buffer.
    pub fn into_owned(self) -> Frame<'static> {
        Frame {
            message_type: self.message_type,
            head: self.head,
            body: Cow::Owned(self.body.into_owned()),
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.body, Cow::Owned(_))
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(&self.head);
        out.extend_from_slice(&self.body);
        out
    }
}

/// Undo compression for a message whose header was already validated.
///
/// `rest` holds everything after the header (`header.size - HEADER_SIZE` bytes). Returns the
/// uncompressed bytes that follow the header.
pub fn decode_body(
    header: &Header,
    rest: &[u8],
    message_size_max: usize,
) -> Result<Vec<u8>, WireError> {
    if header.compression != CompressionStatus::Compressed {
        return Ok(rest.to_vec());
    }
    if !compression_available() {
        return Err(WireError::FeatureUnavailable {
            feature: "compression",
        });
    }
    if rest.len() < 4 {
        return Err(WireError::Truncated {
            needed: 4,
            have: rest.len(),
        });
    }

    let declared = i32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
    if declared < HEADER_SIZE as i32 {
        return Err(WireError::IllegalMessageSize {
            size: declared.into(),
        });
    }
    let declared = declared as usize;
    if declared > message_size_max {
        return Err(WireError::MemoryLimit {
            size: declared,
            max: message_size_max,
        });
    }

    let body = decompress_with_limit(&rest[4..], declared - HEADER_SIZE)?;
    if body.len() != declared - HEADER_SIZE {
        return Err(WireError::Decompression {
            message: format!(
                "uncompressed size mismatch: declared {declared}, got {}",
                body.len() + HEADER_SIZE
            ),
        });
    }
    Ok(body)
}

/// Decode one complete message from the start of `buf`.
pub fn decode_message(buf: &[u8], message_size_max: usize) -> Result<(Header, Vec<u8>), WireError> {
    let header = Header::decode(buf, message_size_max)?;
    if buf.len() < header.size {
        return Err(WireError::Truncated {
            needed: header.size,
            have: buf.len(),
        });
    }
    let body = decode_body(&header, &buf[HEADER_SIZE..header.size], message_size_max)?;
    Ok((header, body))
}
