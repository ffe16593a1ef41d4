//! Errors, logging and the observability event stream.

pub mod error;
pub mod logging;
pub mod summary;

pub use error::{DenoiseError, Result};
pub use summary::SummaryWriter;
