//! Common types for the account lease workspace

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
