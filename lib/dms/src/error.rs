use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("modem transport error: {0}")]
    Transport(#[from] anyhow::Error),
    #[error("modem response missing required field: {0}")]
    ProtocolViolation(&'static str),
    #[error("set power read-back disagreed with requested mode: requested {requested:?}, observed {observed:?}")]
    General {
        requested: crate::OperatingMode,
        observed: crate::OperatingMode,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
