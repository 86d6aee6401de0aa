//! Shared types for the Spotify auth agent workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
