use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Test error: {0}")]
    Test(String),

    /// Raw socket creation was refused by the OS.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Destination {0} not responding")]
    DestinationNotResponding(IpAddr),

    #[error("Test already exists: {0}")]
    DuplicateTest(String),
}

impl Error {
    /// Errors that must terminate the whole test instead of a single worker.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::PermissionDenied(_) | Error::DestinationNotResponding(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
