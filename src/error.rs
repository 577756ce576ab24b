use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Terminal errors surfaced by a transfer session. None of these are
/// retried internally; the caller decides whether to start a new session.
#[derive(Debug, Error)]
pub enum Error {
    #[error("rendezvous server unreachable: {0}")]
    RendezvousUnreachable(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("key exchange failed; the codes did not match")]
    PakeFailed,

    #[error("message failed authentication")]
    AuthFail,

    #[error("frame of {0} bytes exceeds the 100 MiB limit")]
    FrameTooLarge(u32),

    #[error("could not establish a direct connection to the peer")]
    TransitFailed,

    #[error("transfer ended after {received} of {expected} bytes")]
    Truncated { received: u64, expected: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}
