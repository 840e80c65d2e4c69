pub mod loader;
pub mod models;
pub mod validation;

pub use models::ProxyConfig;
pub use validation::{ProxyConfigValidator, ValidationError};
