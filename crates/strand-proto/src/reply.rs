use crate::{OutputStream, WireError};

/// First byte of every reply payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReplyStatus {
    Ok,
    UserException,
    ObjectNotExist,
    FacetNotExist,
    OperationNotExist,
    UnknownLocalException,
    UnknownUserException,
    UnknownException,
}

impl ReplyStatus {
    pub fn byte(self) -> u8 {
        match self {
            ReplyStatus::Ok => 0,
            ReplyStatus::UserException => 1,
            ReplyStatus::ObjectNotExist => 2,
            ReplyStatus::FacetNotExist => 3,
            ReplyStatus::OperationNotExist => 4,
            ReplyStatus::UnknownLocalException => 5,
            ReplyStatus::UnknownUserException => 6,
            ReplyStatus::UnknownException => 7,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => ReplyStatus::Ok,
            1 => ReplyStatus::UserException,
            2 => ReplyStatus::ObjectNotExist,
            3 => ReplyStatus::FacetNotExist,
            4 => ReplyStatus::OperationNotExist,
            5 => ReplyStatus::UnknownLocalException,
            6 => ReplyStatus::UnknownUserException,
            7 => ReplyStatus::UnknownException,
            _ => return None,
        })
    }

    /// Whether the call reached the application and returned normally or with a declared
    /// exception.
    pub fn is_application_outcome(self) -> bool {
        matches!(self, ReplyStatus::Ok | ReplyStatus::UserException)
    }

    /// Split a reply payload into its status and the remaining bytes.
    pub fn split(payload: &[u8]) -> Result<(Option<ReplyStatus>, &[u8]), WireError> {
        match payload.split_first() {
            Some((&status, rest)) => Ok((ReplyStatus::from_byte(status), rest)),
            None => Err(WireError::Truncated { needed: 1, have: 0 }),
        }
    }
}

/// Build a runtime-generated reply payload: the status byte followed by a size-prefixed
/// diagnostic string.
pub fn encode_error_reply(status: ReplyStatus, message: &str) -> Vec<u8> {
    let mut out = OutputStream::with_capacity(1 + 5 + message.len());
    out.write_u8(status.byte());
    out.write_string(message);
    out.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InputStream;
    use bytes::Bytes;

    #[test]
    fn error_reply_carries_status_and_message() {
        let payload = encode_error_reply(ReplyStatus::ObjectNotExist, "no dispatcher");
        let (status, rest) = ReplyStatus::split(&payload).expect("split");
        assert_eq!(status, Some(ReplyStatus::ObjectNotExist));

        let mut input = InputStream::new(Bytes::copy_from_slice(rest));
        assert_eq!(input.read_string().expect("message"), "no dispatcher");
    }

    #[test]
    fn unknown_status_bytes_are_preserved_as_none() {
        let (status, rest) = ReplyStatus::split(&[42, 1, 2]).expect("split");
        assert_eq!(status, None);
        assert_eq!(rest, &[1, 2]);
        assert!(ReplyStatus::split(&[]).is_err());
    }
}
