//! Session error type.

use tracebench_transfer::TransferError;

use crate::session::{AbortInfo, SessionState};

/// A fatal session error, tagged with where the run stopped.
#[derive(Debug, thiserror::Error)]
#[error(
    "session failed while {state}{}{}: {source}",
    in_file(.file),
    after_abort(.aborted)
)]
pub struct SessionFailure {
    /// State the session was in when the error occurred.
    pub state: SessionState,
    /// File being transferred, if any.
    pub file: Option<String>,
    /// Files the peer accepted before the failure.
    pub completed: usize,
    /// Rejection that stopped the file loop before the failure, if any.
    pub aborted: Option<AbortInfo>,
    #[source]
    pub source: TransferError,
}

fn in_file(file: &Option<String>) -> String {
    file.as_ref()
        .map(|f| format!(" (file {f})"))
        .unwrap_or_default()
}

fn after_abort(aborted: &Option<AbortInfo>) -> String {
    aborted
        .as_ref()
        .map(|a| format!(" after {} was rejected with {:?}", a.file, a.ack))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_state_and_file() {
        let err = SessionFailure {
            state: SessionState::Transferring,
            file: Some("cat.jpg".into()),
            completed: 2,
            aborted: None,
            source: TransferError::Timeout("chunk ack"),
        };
        assert_eq!(
            err.to_string(),
            "session failed while transferring (file cat.jpg): chunk ack timed out"
        );

        let err = SessionFailure {
            state: SessionState::Init,
            file: None,
            completed: 0,
            aborted: None,
            source: TransferError::Cancelled,
        };
        assert_eq!(err.to_string(), "session failed while init: cancelled");

        let err = SessionFailure {
            state: SessionState::Collecting,
            file: None,
            completed: 1,
            aborted: Some(AbortInfo {
                file: "b.bin".into(),
                ack: "NO".into(),
            }),
            source: TransferError::ResultCountMismatch {
                expected: 3,
                received: 2,
            },
        };
        assert_eq!(
            err.to_string(),
            "session failed while collecting after b.bin was rejected with \"NO\": \
             expected 3 results, received 2"
        );
    }
}
