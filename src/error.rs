use std::io;

/// An error in a registry exchange or a mail node operation.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("invalid mail address {0:?} (expected user@node)")]
    Address(String),
    #[error("node {0:?} is not available in the registry")]
    Unresolved(String),
    #[error("unexpected registry reply: {0}")]
    Protocol(String),
}
