pub mod loader;
pub mod models;
pub mod seed;
pub mod validation;

pub use loader::load_config;
pub use models::*;
pub use seed::seed_change_logs;
pub use validation::{ConfigValidator, ValidationError, ValidationResult};
