use thiserror::Error;

/// The closed set of error kinds a migration session can fail with.
///
/// Every module in this workspace reduces its failures to one of these
/// kinds before it crosses a component boundary; only leaf modules (the
/// wire codec, the device-model RPC client) are allowed their own richer
/// error types, and those all have a `From` impl into this one.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid: {0}")]
    Invalid(String),

    #[error("timed out waiting for {0}")]
    TimedOut(String),

    #[error("peer gone: {0}")]
    PeerGone(String),

    #[error("device mismatch: {0}")]
    DeviceMismatch(String),

    #[error("failed: {0}")]
    Failed(String),

    #[error("out of memory: {0}")]
    NoMem(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] crate::wire::CodecError),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::Invalid(msg.into())
    }

    pub fn timed_out(what: impl Into<String>) -> Self {
        Error::TimedOut(what.into())
    }

    pub fn peer_gone(msg: impl Into<String>) -> Self {
        Error::PeerGone(msg.into())
    }

    pub fn device_mismatch(msg: impl Into<String>) -> Self {
        Error::DeviceMismatch(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Error::Failed(msg.into())
    }
}
