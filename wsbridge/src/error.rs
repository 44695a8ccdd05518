use thiserror::Error;

/// Errors raised while establishing the TCP leg of a session.
///
/// Whatever the variant, the rendered message is what the client sees in the
/// failure frame, so keep these short and self-contained.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid target port {port:?}")]
    InvalidPort { port: String },

    #[error(transparent)]
    Connect(#[from] std::io::Error),
}
