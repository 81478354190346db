#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to spawn helper process: {0}")]
    Process(#[from] std::io::Error),

    #[error("helper process exited before acknowledging {0}")]
    PeerGone(&'static str),

    #[error("timed out waiting for {0}")]
    TimedOut(&'static str),

    #[error("config store error: {0}")]
    ConfigStore(String),

    #[error("device model rpc error: {0}")]
    DeviceModel(String),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl From<Error> for shared::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Process(io) => shared::Error::Io(io),
            Error::PeerGone(what) => shared::Error::peer_gone(what),
            Error::TimedOut(what) => shared::Error::timed_out(what),
            Error::ConfigStore(msg) => shared::Error::failed(msg),
            Error::DeviceModel(msg) => shared::Error::failed(msg),
            Error::InvalidState(msg) => shared::Error::invalid(msg),
        }
    }
}
