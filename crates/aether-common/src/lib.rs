mod config;
mod error;
mod ids;
mod sanitize;

pub use config::{GatewayConfig, GatewayConfigPatch};
pub use error::{GatewayError, GatewayResult};
pub use ids::{new_request_id, new_short_id};
pub use sanitize::sanitize_error_message;
