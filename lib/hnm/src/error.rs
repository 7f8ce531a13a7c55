use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("netlink operation failed: {0}")]
    Netlink(#[from] anyhow::Error),
    #[error("interface {0:?} not found")]
    LinkNotFound(&'static str),
    #[error("wwan interface index diverged between address families: v4={v4} v6={v6}")]
    IfindexDivergence { v4: i32, v6: i32 },
}

pub type Result<T> = std::result::Result<T, Error>;
