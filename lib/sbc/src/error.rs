use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("service bus operation failed: {0}")]
    Bus(#[from] systemd_client::Error),
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{binary} terminated abnormally: {status}")]
    AbnormalExit { binary: String, status: std::process::ExitStatus },
}

pub type Result<T> = std::result::Result<T, Error>;
