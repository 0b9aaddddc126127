//! Types shared by the flow gateway crates

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
