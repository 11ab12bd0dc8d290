mod error;
mod proxy;

pub use error::{error_response, unauthorized};
pub use proxy::{ProxyState, proxy_router};
