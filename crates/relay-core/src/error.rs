use thiserror::Error;

/// Errors produced by the tunnel protocol and relay layers.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("truncated header: need {need} bytes, have {have}")]
    TruncatedHeader { need: usize, have: usize },

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("config sync failed: {0}")]
    ConfigSync(String),

    #[error("dns relay error: {0}")]
    Dns(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type TunnelResult<T> = Result<T, TunnelError>;
