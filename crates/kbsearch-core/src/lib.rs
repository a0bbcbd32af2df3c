//! kbsearch-core
//!
//! Data model, collaborator contracts, error taxonomy and configuration shared
//! by the store adapters and the hybrid retrieval pipeline.

pub mod config;
pub mod error;
pub mod loader;
pub mod text;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
