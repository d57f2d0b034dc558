use crate::LocalError;

/// One-way requests accumulated into a single batch message.
#[derive(Debug, Default)]
pub struct BatchQueue {
    buf: Vec<u8>,
    count: i32,
    auto_flush_size: usize,
    destroyed: Option<LocalError>,
}

impl BatchQueue {
    /// `auto_flush_size` of 0 disables automatic flushing.
    pub fn new(auto_flush_size: usize) -> Self {
        Self {
            auto_flush_size,
            ..Self::default()
        }
    }

    /// Append one marshaled request.
    ///
    /// If appending would grow the batch past the auto-flush size, the batch accumulated so far
    /// is returned for sending and `payload` starts a new one.
    pub fn enqueue(&mut self, payload: &[u8]) -> Result<Option<(Vec<u8>, i32)>, LocalError> {
        if let Some(cause) = &self.destroyed {
            return Err(cause.clone());
        }

        let flushed = if self.auto_flush_size > 0
            && self.count > 0
            && self.buf.len() + payload.len() > self.auto_flush_size
        {
            Some(self.swap_and_clear())
        } else {
            None
        };

        self.buf.extend_from_slice(payload);
        self.count += 1;
        Ok(flushed)
    }

    /// Hand off the accumulated requests and start over.
    pub fn swap_and_clear(&mut self) -> (Vec<u8>, i32) {
        let count = std::mem::take(&mut self.count);
        (std::mem::take(&mut self.buf), count)
    }

    /// Discard pending requests; later enqueues fail with `cause`.
    ///
    /// Batched requests are one-way, so there is nobody to notify about the discarded ones.
    pub fn destroy(&mut self, cause: LocalError) {
        self.buf = Vec::new();
        self.count = 0;
        if self.destroyed.is_none() {
            self.destroyed = Some(cause);
        }
    }

    pub fn count(&self) -> i32 {
        self.count
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
