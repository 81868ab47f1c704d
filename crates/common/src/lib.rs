//! Common types shared by the session-keeper workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
