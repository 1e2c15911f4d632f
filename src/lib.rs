//! # jailrun
//!
//! One-shot execution of untrusted Python inside nsjail.
//!
//! ## Features
//!
//! - **Validated submissions:** size ceiling and a required `def main():`, checked before anything runs
//! - **Graceful degradation:** a static catalog of isolation profiles, tried strongest first
//! - **Structured results:** the return value of `main()` travels back as JSON, separate from stdout
//! - **No leftovers:** every attempt runs in its own workspace and process group

pub mod config;
pub mod error;
pub mod gateway;
pub mod sandbox;

pub use config::Config;
pub use error::{Error, Result};
pub use sandbox::{create_sandbox, Execution, ExecutionOutcome, Sandbox};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
