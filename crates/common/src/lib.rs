//! Types shared across the relay gateway crates: the redacting `Secret`
//! wrapper and the configuration error.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
