//! Configuration management for pacproxy

pub mod loader;
pub mod schema;
pub mod validator;

pub use loader::ConfigLoader;
pub use schema::{Config, HealthConfig, PacConfig, SandboxConfig, ServerConfig};
pub use validator::ConfigValidator;
