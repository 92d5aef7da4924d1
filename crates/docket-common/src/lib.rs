//! Common utilities for docket
//!
//! Shared error type and logging setup used by the compiler crates.

pub mod error;
pub mod logging;

pub use error::{DocketError, Result};
pub use logging::init_tracing;
