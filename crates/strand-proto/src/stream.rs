use bytes::Bytes;

use crate::{WireError, MAX_SIZE};

/// Number of bytes `encode_size` produces for `n`.
pub fn encoded_size_len(n: usize) -> usize {
    if n < 255 {
        1
    } else {
        5
    }
}

/// Append the compact encoding of `n`: one byte when `n < 255`, otherwise `0xFF` followed by a
/// little-endian `i32`.
///
/// # Panics
///
/// Panics if `n` exceeds [`MAX_SIZE`].
pub fn encode_size(n: usize, out: &mut Vec<u8>) {
    assert!(n <= MAX_SIZE, "size {n} is not representable");
    if n < 255 {
        out.push(n as u8);
    } else {
        out.push(0xFF);
        out.extend_from_slice(&(n as i32).to_le_bytes());
    }
}

/// Decode a compact size, returning the value and the number of bytes consumed.
pub fn decode_size(buf: &[u8]) -> Result<(usize, usize), WireError> {
    let Some(&first) = buf.first() else {
        return Err(WireError::Truncated { needed: 1, have: 0 });
    };
    if first != 0xFF {
        return Ok((first as usize, 1));
    }
    if buf.len() < 5 {
        return Err(WireError::Truncated {
            needed: 5,
            have: buf.len(),
        });
    }
    let v = i32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if v < 0 {
        return Err(WireError::NegativeSize { size: v });
    }
    Ok((v as usize, 5))
}

/// Growable little-endian writer.
#[derive(Debug, Default, Clone)]
pub struct OutputStream {
    buf: Vec<u8>,
}

impl OutputStream {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_size(&mut self, n: usize) {
        encode_size(n, &mut self.buf);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Size-prefixed byte sequence.
    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.write_size(bytes.len());
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_blob(s.as_bytes());
    }

    /// Overwrite four bytes at `offset` with `v`.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 4` is past the end of the stream.
    pub fn patch_i32(&mut self, offset: usize, v: i32) {
        self.buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
    }
}

/// Cursor over a received message body.
///
/// Reads are zero-copy: `read_bytes` and `rest` return slices of the shared buffer.
#[derive(Debug, Clone)]
pub struct InputStream {
    buf: Bytes,
    pos: usize,
}

impl InputStream {
    pub fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    fn require(&self, n: usize) -> Result<(), WireError> {
        match self.pos.checked_add(n) {
            Some(end) if end <= self.buf.len() => Ok(()),
            _ => Err(WireError::Truncated {
                needed: n,
                have: self.remaining(),
            }),
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        self.require(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        self.require(4)?;
        let p = self.pos;
        let v = i32::from_le_bytes([self.buf[p], self.buf[p + 1], self.buf[p + 2], self.buf[p + 3]]);
        self.pos += 4;
        Ok(v)
    }

    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        self.require(8)?;
        let mut le = [0u8; 8];
        le.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(i64::from_le_bytes(le))
    }

    pub fn read_size(&mut self) -> Result<usize, WireError> {
        let (n, consumed) = decode_size(&self.buf[self.pos..])?;
        self.pos += consumed;
        Ok(n)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, WireError> {
        self.require(len)?;
        let bytes = self.buf.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_blob(&mut self) -> Result<Bytes, WireError> {
        let len = self.read_size()?;
        self.read_bytes(len)
    }

    pub fn read_string(&mut self) -> Result<String, WireError> {
        let bytes = self.read_blob()?;
        String::from_utf8(bytes.to_vec()).map_err(|err| WireError::InvalidString {
            message: err.to_string(),
        })
    }

    pub fn skip(&mut self, n: usize) -> Result<(), WireError> {
        self.require(n)?;
        self.pos += n;
        Ok(())
    }

    /// Everything not yet consumed; the cursor moves to the end.
    pub fn rest(&mut self) -> Bytes {
        let bytes = self.buf.slice(self.pos..);
        self.pos = self.buf.len();
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn size_codec_is_lossless(n in 0usize..=MAX_SIZE) {
            let mut out = Vec::new();
            encode_size(n, &mut out);
            prop_assert_eq!(out.len(), encoded_size_len(n));
            prop_assert_eq!(out.len() == 1, n < 255);
            prop_assert_eq!(decode_size(&out), Ok((n, out.len())));
        }
    }

    #[test]
    fn size_boundary_switches_to_long_form_at_255() {
        let mut out = Vec::new();
        encode_size(254, &mut out);
        assert_eq!(out, [254]);

        out.clear();
        encode_size(255, &mut out);
        assert_eq!(out, [0xFF, 255, 0, 0, 0]);
    }

    #[test]
    fn negative_long_form_size_is_rejected() {
        let mut buf = vec![0xFF];
        buf.extend_from_slice(&(-7i32).to_le_bytes());
        assert_eq!(decode_size(&buf), Err(WireError::NegativeSize { size: -7 }));
    }

    #[test]
    fn truncated_long_form_size_is_rejected() {
        assert!(matches!(
            decode_size(&[0xFF, 1, 0]),
            Err(WireError::Truncated { needed: 5, have: 3 })
        ));
        assert!(matches!(
            decode_size(&[]),
            Err(WireError::Truncated { needed: 1, have: 0 })
        ));
    }

    #[test]
    fn input_stream_reads_what_output_stream_wrote() {
        let mut out = OutputStream::new();
        out.write_i32(-42);
        out.write_bool(true);
        out.write_string("ping");
        out.write_blob(&[7u8; 300]);
        out.write_i64(1 << 40);

        let mut input = InputStream::new(Bytes::from(out.into_vec()));
        assert_eq!(input.read_i32().unwrap(), -42);
        assert!(input.read_bool().unwrap());
        assert_eq!(input.read_string().unwrap(), "ping");
        assert_eq!(input.read_blob().unwrap().len(), 300);
        assert_eq!(input.read_i64().unwrap(), 1 << 40);
        assert!(input.is_empty());
        assert!(input.read_u8().is_err());
    }

    #[test]
    fn oversized_blob_length_fails_without_reading_past_the_end() {
        let mut out = OutputStream::new();
        out.write_size(10_000);
        out.write_bytes(b"short");
        let mut input = InputStream::new(Bytes::from(out.into_vec()));
        assert!(matches!(
            input.read_blob(),
            Err(WireError::Truncated { needed: 10_000, .. })
        ));
    }
}
