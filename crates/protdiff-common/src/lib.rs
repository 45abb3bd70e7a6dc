//! Common types and utilities shared by the protdiff crates
//!
//! This crate provides the foundation the loss and evaluation crates build
//! on: the error taxonomy, TOML configuration, the protein tokenizer, tensor
//! shape/mask helpers and the logging bootstrap.

pub mod config;
pub mod error;
pub mod logging;
pub mod tensor;
pub mod tokenizer;

pub use config::{ConfigError, EvalConfig, LossConfig, ProtDiffConfig};
pub use error::{ProtDiffError, Result};
pub use logging::init_logging;
pub use tokenizer::{ProteinTokenizer, Tokenizer};
