use strand_proto::WireError;

/// Why a connection stopped (or refused) carrying traffic.
///
/// A connection records the first cause it sees and never replaces it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocalError {
    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),

    #[error("connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("timed out establishing the connection")]
    ConnectTimeout,

    #[error("timed out transferring a message")]
    RequestTimeout,

    #[error("timed out closing the connection")]
    CloseTimeout,

    #[error("connection closed after being idle")]
    IdleTimeout,

    #[error("connection closed by peer")]
    ClosedByPeer,

    #[error("connection closed by the application ({})", if *graceful { "graceful" } else { "forceful" })]
    ManuallyClosed { graceful: bool },

    #[error("adapter deactivated")]
    AdapterDeactivated,

    #[error("runtime destroyed")]
    RuntimeDestroyed,

    #[error("invocation canceled")]
    InvocationCanceled,

    #[error("wait interrupted")]
    Interrupted,

    #[error("connection not validated")]
    ConnectionNotValidated,
}

impl LocalError {
    pub fn io(err: &std::io::Error) -> Self {
        LocalError::ConnectionLost {
            message: err.to_string(),
        }
    }

    /// Causes after which a request may be resent on another connection even if it was
    /// transmitted.
    pub fn is_safe_to_retry(&self) -> bool {
        matches!(
            self,
            LocalError::ClosedByPeer | LocalError::AdapterDeactivated | LocalError::RuntimeDestroyed
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            LocalError::ConnectTimeout
                | LocalError::RequestTimeout
                | LocalError::CloseTimeout
                | LocalError::IdleTimeout
        )
    }
}

/// Outcome reported to the caller of a failed invocation.
///
/// `Retryable` means resending cannot violate at-most-once delivery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvocationError {
    #[error("{0} (retryable)")]
    Retryable(LocalError),

    #[error("{0}")]
    Fatal(LocalError),
}

impl InvocationError {
    /// Classify a connection failure for a request.
    ///
    /// `sent` is whether any byte of the request left this process.
    pub fn classify(cause: LocalError, sent: bool, idempotent: bool) -> Self {
        if !sent || idempotent || cause.is_safe_to_retry() {
            InvocationError::Retryable(cause)
        } else {
            InvocationError::Fatal(cause)
        }
    }

    pub fn cause(&self) -> &LocalError {
        match self {
            InvocationError::Retryable(cause) | InvocationError::Fatal(cause) => cause,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, InvocationError::Retryable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsent_requests_are_always_retryable() {
        let err = InvocationError::classify(LocalError::RequestTimeout, false, false);
        assert!(err.is_retryable());
    }

    #[test]
    fn sent_requests_retry_only_for_safe_causes_or_idempotent_calls() {
        assert!(!InvocationError::classify(LocalError::RequestTimeout, true, false).is_retryable());
        assert!(InvocationError::classify(LocalError::RequestTimeout, true, true).is_retryable());
        assert!(InvocationError::classify(LocalError::ClosedByPeer, true, false).is_retryable());
        assert!(
            InvocationError::classify(LocalError::AdapterDeactivated, true, false).is_retryable()
        );
    }

    #[test]
    fn wire_errors_convert_into_protocol_causes() {
        let cause: LocalError = WireError::UnknownMessageType { tag: 9 }.into();
        assert_eq!(cause.to_string(), "protocol error: unknown message type: 9");
        assert_eq!(
            InvocationError::Fatal(cause.clone()).cause(),
            &LocalError::Protocol(WireError::UnknownMessageType { tag: 9 })
        );
    }
}
