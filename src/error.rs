//! Error type for the dCGP engine.
//!
//! All boundary checks at public entry points report [`DcgpError::InvalidArgument`]
//! with a message naming the offending quantity and its expected range.
//! Numerical pathologies (protected division, non-finite losses, singular
//! Hessians) are never surfaced through this type: they are absorbed where
//! they occur, so they cannot poison a search loop.

use std::fmt;

/// Error raised when a caller violates an API contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DcgpError {
    /// A malformed argument: wrong size, index out of range, unknown name,
    /// or a value outside its allowed range.
    InvalidArgument(String),
}

impl DcgpError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

impl fmt::Display for DcgpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for DcgpError {}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DcgpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_the_quantity() {
        let err = DcgpError::invalid("number of rows is 0, it must be at least 1");
        let msg = err.to_string();
        assert!(msg.contains("invalid argument"), "got: {msg}");
        assert!(msg.contains("number of rows"), "got: {msg}");
    }
}
