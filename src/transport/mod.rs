//! Encrypted data-plane transport for compute connections.

pub mod secure;

use thiserror::Error;

pub use secure::{SecureTransport, MAX_FRAME_LEN};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Frame failed authentication; data was tampered with or corrupted")]
    Tampered,

    #[error("Data corruption: {0}")]
    DataCorruption(String),

    #[error("Transport has been disposed")]
    Disposed,

    #[error("Invalid key length {0}, expected 32 bytes")]
    InvalidKey(usize),

    #[error("Encryption failed")]
    Encryption,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
