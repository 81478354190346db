pub mod primary;
pub mod proxy;
pub mod secondary;

pub use primary::ColoPrimarySession;
pub use proxy::ColoProxyClient;
pub use secondary::ColoSecondarySession;
