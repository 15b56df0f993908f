//! Error types for the wire protocol.

/// Errors produced while reading or writing protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the connection")]
    Closed,

    #[error("protocol violation: {0}")]
    Violation(String),
}

impl ProtocolError {
    /// Maps an early EOF from `read_exact` to [`ProtocolError::Closed`].
    pub fn from_read(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Closed
        } else {
            Self::Io(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn early_eof_is_closed_other_errors_stay_io() {
        let closed = ProtocolError::from_read(Error::from(ErrorKind::UnexpectedEof));
        assert!(matches!(closed, ProtocolError::Closed));

        let reset = ProtocolError::from_read(Error::from(ErrorKind::ConnectionReset));
        assert!(matches!(reset, ProtocolError::Io(e) if e.kind() == ErrorKind::ConnectionReset));
    }
}
