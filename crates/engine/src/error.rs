#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Shared(#[from] shared::Error),

    #[error(transparent)]
    Helper(#[from] hv_helper_sdk::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
