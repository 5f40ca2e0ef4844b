use thiserror::Error;

/// Error taxonomy for the tunnel core.
///
/// Negotiation-time and local-probe failures are fatal to the whole
/// session; everything else is scoped to a single relay connection and
/// never aborts its siblings.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("broker negotiation failed: {0}")]
    Negotiation(#[from] reqwest::Error),

    #[error("broker returned an invalid assignment: {0}")]
    InvalidAssignment(String),

    #[error("tunnel has not been negotiated yet")]
    NotNegotiated,

    #[error("no service listening on localhost:{0}")]
    LocalPortUnreachable(u16),

    #[error("proxy rejected CONNECT: {0}")]
    ProxyRejected(String),

    #[error("malformed response from proxy")]
    ProxyProtocolError,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
