use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    /// The tracker answered with a `failure reason`.
    #[error("tracker failure: {0}")]
    Failure(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}
