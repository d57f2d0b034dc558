use std::sync::Arc;

use strand_proto::{Frame, MessageType, WireError};

use crate::ReplyHandler;

/// A message on its way to the transport.
pub(crate) struct OutgoingMessage<'a> {
    pub(crate) frame: Frame<'a>,
    /// Present for requests whose caller wants to hear about the send.
    pub(crate) handle: Option<Arc<dyn ReplyHandler>>,
    /// Non-zero for two-way requests.
    pub(crate) request_id: i32,
    pub(crate) idempotent: bool,
    compress: bool,
    prepared: bool,
    pub(crate) written: usize,
}

impl<'a> OutgoingMessage<'a> {
    pub(crate) fn new(frame: Frame<'a>, compress: bool) -> Self {
        Self {
            frame,
            handle: None,
            request_id: 0,
            idempotent: false,
            compress,
            prepared: false,
            written: 0,
        }
    }

    pub(crate) fn request(
        frame: Frame<'a>,
        handle: Option<Arc<dyn ReplyHandler>>,
        request_id: i32,
        idempotent: bool,
        compress: bool,
    ) -> Self {
        Self {
            handle,
            request_id,
            idempotent,
            ..Self::new(frame, compress)
        }
    }

    /// Take a private copy of any caller-owned bytes so the message can be queued.
    pub(crate) fn adopt(self) -> OutgoingMessage<'static> {
        OutgoingMessage {
            frame: self.frame.into_owned(),
            handle: self.handle,
            request_id: self.request_id,
            idempotent: self.idempotent,
            compress: self.compress,
            prepared: self.prepared,
            written: self.written,
        }
    }

    /// Finalize compression and the header; a no-op after the first call.
    pub(crate) fn prepare(&mut self, compression_level: i32) -> Result<(), WireError> {
        if !self.prepared {
            self.frame.prepare(self.compress, compression_level)?;
            self.prepared = true;
        }
        Ok(())
    }

    pub(crate) fn remaining(&self) -> &[u8] {
        self.frame.chunk(self.written)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.prepared && self.written >= self.frame.len()
    }

    pub(crate) fn message_type(&self) -> MessageType {
        self.frame.message_type()
    }

    /// Heartbeats do not count as activity.
    pub(crate) fn is_heartbeat(&self) -> bool {
        self.message_type() == MessageType::ValidateConnection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adopted_message_keeps_progress_and_owns_its_bytes() {
        let mut payload = vec![1u8, 2, 3, 4];
        let mut message = OutgoingMessage::new(Frame::reply(9, &payload[..]), false);
        message.prepare(1).expect("prepare");
        message.written = 3;

        let adopted = message.adopt();
        payload.clear();
        assert_eq!(adopted.written, 3);
        assert!(adopted.frame.is_owned());
        assert!(!adopted.is_done());

        let mut rest = Vec::new();
        let mut pos = adopted.written;
        while pos < adopted.frame.len() {
            let chunk = adopted.frame.chunk(pos);
            rest.extend_from_slice(chunk);
            pos += chunk.len();
        }
        assert_eq!(rest, adopted.frame.to_vec()[3..]);
        assert!(rest.ends_with(&[1, 2, 3, 4]));
    }

    #[test]
    fn prepare_runs_once() {
        let mut message = OutgoingMessage::new(Frame::request(1, vec![0u8; 4]), false);
        message.prepare(1).expect("prepare");
        let len = message.frame.len();
        message.prepare(1).expect("prepare again");
        assert_eq!(message.frame.len(), len);
        message.written = len;
        assert!(message.is_done());
    }
}
