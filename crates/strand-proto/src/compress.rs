use crate::WireError;

/// Whether this build can compress and decompress message bodies.
pub fn compression_available() -> bool {
    cfg!(feature = "zstd")
}

/// Clamp a configured compression level into the supported `1..=9` range.
pub fn clamp_compression_level(level: i32) -> i32 {
    level.clamp(1, 9)
}

#[cfg(feature = "zstd")]
pub(crate) fn compress(data: &[u8], level: i32) -> Result<Vec<u8>, WireError> {
    zstd::bulk::compress(data, clamp_compression_level(level)).map_err(|err| {
        WireError::Compression {
            message: format!("zstd compress failed: {err}"),
        }
    })
}

#[cfg(not(feature = "zstd"))]
pub(crate) fn compress(_data: &[u8], _level: i32) -> Result<Vec<u8>, WireError> {
    Err(WireError::FeatureUnavailable {
        feature: "compression",
    })
}

/// Decompress `data`, refusing to produce more than `limit` bytes.
#[cfg(feature = "zstd")]
pub(crate) fn decompress_with_limit(data: &[u8], limit: usize) -> Result<Vec<u8>, WireError> {
    use std::io::Read;

    let mut decoder =
        zstd::stream::read::Decoder::new(data).map_err(|err| WireError::Decompression {
            message: format!("create zstd decoder: {err}"),
        })?;
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = decoder
            .read(&mut buf)
            .map_err(|err| WireError::Decompression {
                message: format!("read zstd stream: {err}"),
            })?;
        if n == 0 {
            break;
        }
        if out.len() + n > limit {
            return Err(WireError::MemoryLimit {
                size: out.len() + n,
                max: limit,
            });
        }
        out.try_reserve(n).map_err(|err| WireError::Decompression {
            message: format!(
                "allocate decompression buffer ({} bytes): {err}",
                out.len() + n
            ),
        })?;
        out.extend_from_slice(&buf[..n]);
    }
    Ok(out)
}

#[cfg(not(feature = "zstd"))]
pub(crate) fn decompress_with_limit(_data: &[u8], _limit: usize) -> Result<Vec<u8>, WireError> {
    Err(WireError::FeatureUnavailable {
        feature: "compression",
    })
}
