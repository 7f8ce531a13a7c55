//! `SupervisorError` realizes spec §7's error kinds as a `thiserror` enum,
//! with `#[from]` conversions from each collaborator crate's own typed
//! error. The conversions are where the classification in spec §4.6
//! ("Fault classification") actually happens: a `hnm::Error` or
//! `sbc::Error` can only ever mean a host-layer fault, so it always maps to
//! `HostFailure`; a `wds::Error::SessionRefused` always maps to the
//! session-layer kind the outer loop tolerates and retries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A required field was absent from a modem response, or a read-back
    /// disagreed with a just-issued write.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Send/receive against the modem failed below the protocol layer.
    #[error("modem transport failure: {0}")]
    TransportFailure(#[source] anyhow::Error),

    /// An idempotent operation was a no-op. Swallowed at the call sites
    /// that tolerate it (`wds::WdsSession::stop_data_session`,
    /// `hnm`'s create-or-replace submits); kept as a variant here for
    /// parity with spec §7 even though no current call site constructs it.
    #[error("idempotent operation had no effect")]
    NoEffect,

    /// Start-session returned an error code, with optional failure-reason
    /// fields logged verbatim by the `wds` crate before this is
    /// constructed.
    #[error("start-session refused by modem: reason={reason:?} verbose={verbose:?}")]
    SessionRefused {
        reason: Option<u16>,
        verbose: Option<(u16, u16)>,
    },

    /// Netlink, service-bus, or subprocess operation failed. Always
    /// promotes to `exit_requested` (spec §4.6 fault classification 1).
    #[error("host-layer failure: {0}")]
    HostFailure(#[source] anyhow::Error),

    /// The modem reported a hardware-controlled lock preventing the
    /// requested operating mode. A local decision to abort this iteration,
    /// not forwarded to `exit_requested`.
    #[error("operating mode change refused: requested {requested:?}, modem holds {observed:?}")]
    ModeRefused {
        requested: dms::OperatingMode,
        observed: dms::OperatingMode,
    },

    /// The external shutdown signal was observed at a cooperative check.
    #[error("interrupted by shutdown signal")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

impl From<dms::Error> for SupervisorError {
    fn from(e: dms::Error) -> Self {
        match e {
            dms::Error::Transport(err) => SupervisorError::TransportFailure(err),
            dms::Error::ProtocolViolation(field) => SupervisorError::ProtocolViolation(field.to_string()),
            dms::Error::General { requested, observed } => {
                SupervisorError::ProtocolViolation(format!(
                    "set-power read-back disagreed: requested {requested:?}, observed {observed:?}"
                ))
            }
        }
    }
}

impl From<wds::Error> for SupervisorError {
    fn from(e: wds::Error) -> Self {
        match e {
            wds::Error::Transport(err) => SupervisorError::TransportFailure(err),
            wds::Error::ProtocolViolation(field) => SupervisorError::ProtocolViolation(field.to_string()),
            wds::Error::SessionRefused { reason, verbose } => {
                SupervisorError::SessionRefused { reason, verbose }
            }
        }
    }
}

impl From<hnm::Error> for SupervisorError {
    fn from(e: hnm::Error) -> Self {
        SupervisorError::HostFailure(e.into())
    }
}

impl From<sbc::Error> for SupervisorError {
    fn from(e: sbc::Error) -> Self {
        SupervisorError::HostFailure(e.into())
    }
}
