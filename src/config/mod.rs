//! Configuration module
//!
//! - types/mod.rs: Core configuration types (Config, ServerConfig, LogConfig)
//! - types/sandbox.rs: Sandbox/execution configuration
//! - io.rs: Configuration loading
//! - validation.rs: Configuration validation
//! - paths.rs: Configuration file paths

mod io;
mod paths;
mod types;
mod validation;

// Re-export core config types
pub use types::{Config, LogConfig, ServerConfig};

// Re-export sandbox types
pub use types::sandbox::{LimitsConfig, SandboxConfig};

// Re-export IO and utilities
pub use io::{apply_env_overrides, load_config, load_config_from_path, sample_config};
pub use paths::{config_dir, config_path};
pub use validation::{validate_config, ConfigValidationResult, ValidationIssue};
