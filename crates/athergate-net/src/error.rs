//! Error types for the NAT datapath.

use thiserror::Error;

/// Result type alias for datapath operations.
pub type Result<T> = std::result::Result<T, NetError>;

/// Errors that can occur while setting up or driving a packet device.
///
/// Note that the forwarding hot path never returns errors: malformed
/// packets are logged and dropped, and unrecoverable I/O facility
/// failures terminate the process. These variants cover construction
/// and configuration.
/// Logs the message at error level and terminates the process.
///
/// Reserved for unrecoverable facility failures (dead capture handle,
/// broken tunnel, exhausted port table); the forwarding engine never
/// surfaces errors to its callers.
pub(crate) fn fatal(msg: &str) -> ! {
    tracing::error!("{msg}");
    std::process::exit(1);
}

#[derive(Debug, Error)]
pub enum NetError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Packet capture error.
    #[error("capture error: {0}")]
    Capture(#[from] pcap::Error),

    /// Raw IPv4 injection error.
    #[error("inject error: {0}")]
    Inject(String),

    /// Athernet tunnel error.
    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}
