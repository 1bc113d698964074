use core::fmt;
use std::io;

use crate::state::TcpState;
use crate::table::Action;
use crate::time::Duration;

/// The kind of failure a session reports.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The peer refused to emit a segment, or its socket call failed.
    PeerSendFailed,
    /// A call on the IUT socket failed unexpectedly.
    IutCallFailed,
    /// A wait ran out of budget before the expected event.
    Timeout,
    /// The IUT settled in a state other than the target.
    Mismatch,
    /// No table entry and no bootstrap chain for the requested edge.
    TableMiss,
    /// The peer back end cannot produce the required segment.
    BackendUnsupported,
    /// A network configuration call failed.
    ConfigFailed,
    /// A path could not be parsed or names no state.
    BadPath,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::PeerSendFailed => write!(f, "peer send failed"),
            ErrorKind::IutCallFailed => write!(f, "IUT call failed"),
            ErrorKind::Timeout => write!(f, "timed out"),
            ErrorKind::Mismatch => write!(f, "state mismatch"),
            ErrorKind::TableMiss => write!(f, "no transition"),
            ErrorKind::BackendUnsupported => write!(f, "unsupported by peer back end"),
            ErrorKind::ConfigFailed => write!(f, "configuration failed"),
            ErrorKind::BadPath => write!(f, "bad path"),
        }
    }
}

/// A failure, with the edge and the action that were running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    edge: Option<(TcpState, TcpState)>,
    action: Option<Action>,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Error {
        Error {
            kind,
            edge: None,
            action: None,
            message: message.into(),
        }
    }

    /// Wrap a collaborator failure, prefixing the call that produced it.
    pub(crate) fn io(kind: ErrorKind, call: &str, err: io::Error) -> Error {
        Error::new(kind, format!("{}: {}", call, err))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The `(from, to)` pair being attempted, if the error happened on an edge.
    pub fn edge(&self) -> Option<(TcpState, TcpState)> {
        self.edge
    }

    /// The table action that failed, if any.
    pub fn action(&self) -> Option<Action> {
        self.action
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Attach the edge unless a more specific one is already recorded.
    pub(crate) fn at(mut self, from: TcpState, to: TcpState) -> Error {
        self.edge.get_or_insert((from, to));
        self
    }

    pub(crate) fn during(mut self, action: Action) -> Error {
        self.action.get_or_insert(action);
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some((from, to)) = self.edge {
            write!(f, " on {} -> {}", from, to)?;
        }
        if let Some(action) = self.action {
            write!(f, " in {}", action)?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// What running a path produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Every edge ran. `elapsed` is non-zero only when the last edge was
    /// timer driven.
    Ok {
        final_state: TcpState,
        elapsed: Duration,
    },
    /// The stop state was reached before the end of the path.
    Stopped { at_state: TcpState },
    /// An edge failed; `remaining_path` lists what was not executed.
    Err {
        error: Error,
        remaining_path: String,
    },
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Outcome::Stopped { .. })
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Err { error, .. } => Some(error.kind()),
            _ => None,
        }
    }

    pub fn elapsed_ms(&self) -> Option<u64> {
        match self {
            Outcome::Ok { elapsed, .. } => Some(elapsed.total_millis()),
            _ => None,
        }
    }

    /// Collapse into a `Result`, treating a stop as success.
    pub fn into_result(self) -> Result<TcpState> {
        match self {
            Outcome::Ok { final_state, .. } => Ok(final_state),
            Outcome::Stopped { at_state } => Ok(at_state),
            Outcome::Err { error, .. } => Err(error),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Outcome::Ok {
                final_state,
                elapsed,
            } => write!(f, "reached {} ({})", final_state, elapsed),
            Outcome::Stopped { at_state } => write!(f, "stopped at {}", at_state),
            Outcome::Err {
                error,
                remaining_path,
            } => write!(f, "{}; not executed: '{}'", error, remaining_path),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::table::{Action, PeerAction};

    #[test]
    fn test_display_full() {
        let err = Error::new(ErrorKind::BackendUnsupported, "no combined FIN-ACK")
            .during(Action::Peer(PeerAction::FinAck))
            .at(TcpState::FinWait1, TcpState::TimeWait);
        assert_eq!(
            err.to_string(),
            "unsupported by peer back end on FIN_WAIT1 -> TIME_WAIT in peer send_fin_ack: no combined FIN-ACK"
        );
    }

    #[test]
    fn test_first_edge_wins() {
        let err = Error::new(ErrorKind::Timeout, "")
            .at(TcpState::Closed, TcpState::SynSent)
            .at(TcpState::Closed, TcpState::TimeWait);
        assert_eq!(err.edge(), Some((TcpState::Closed, TcpState::SynSent)));
        assert_eq!(err.to_string(), "timed out on CLOSED -> SYN_SENT");
    }

    #[test]
    fn test_outcome_helpers() {
        let ok = Outcome::Ok {
            final_state: TcpState::Closed,
            elapsed: Duration::from_millis(1500),
        };
        assert!(ok.is_ok());
        assert_eq!(ok.elapsed_ms(), Some(1500));
        assert_eq!(ok.kind(), None);

        let stopped = Outcome::Stopped {
            at_state: TcpState::SynSent,
        };
        assert_eq!(stopped.into_result(), Ok(TcpState::SynSent));
    }
}
