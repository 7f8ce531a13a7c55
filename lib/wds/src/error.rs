use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("modem transport error: {0}")]
    Transport(#[from] anyhow::Error),
    #[error("modem response missing required field: {0}")]
    ProtocolViolation(&'static str),
    #[error("start-session refused by modem: reason={reason:?} verbose={verbose:?}")]
    SessionRefused {
        reason: Option<u16>,
        verbose: Option<(u16, u16)>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
