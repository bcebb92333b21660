//! Errors shared by every crate that handles workspace keys.

use thiserror::Error;

/// A string could not be interpreted as a workspace key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("workspace key is empty")]
    Empty,

    #[error("workspace key is not valid url-safe base64: {0}")]
    Encoding(String),
}
