/// Inputs are capped so a single case cannot allocate without bound.
pub const MAX_INPUT_SIZE: usize = 256 * 1024;

/// Message size limit handed to the decoder; small enough that declared sizes past it are
/// exercised often.
pub const MESSAGE_SIZE_MAX: usize = 64 * 1024;

#[inline]
pub fn capped(data: &[u8]) -> &[u8] {
    &data[..data.len().min(MAX_INPUT_SIZE)]
}
