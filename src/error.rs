//! Error kinds shared by the selector, the remote source and the video cache.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No eligible item exists for the request.
    #[error("no eligible video found")]
    NotFound,

    /// The remote data store could not be queried.
    #[error("remote fetch failed: {0}")]
    TransientFetch(String),

    /// Proxy fetch error, non-2xx status or an empty result.
    #[error("download failed: {0}")]
    DownloadFailed(String),

    /// Filesystem access denied, disk full, or the store file is unusable.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl Error {
    pub fn fetch(err: impl std::fmt::Display) -> Self {
        Error::TransientFetch(err.to_string())
    }

    pub fn download(err: impl std::fmt::Display) -> Self {
        Error::DownloadFailed(err.to_string())
    }
}
