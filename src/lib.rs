//! pipelib - pipeline library resolution with a shared cache
//!
//! Resolves named, versioned library references for CI builds and keeps
//! one on-disk copy of each resolved version that every build on the
//! host reuses.

pub mod cache;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod fsutil;
pub mod library;
pub mod pipeline;
pub mod resolve;
pub mod retriever;

pub use error::{PipelibError, PipelibResult};
