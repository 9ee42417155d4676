//! Failures while building frontend messages.

use thiserror::Error;

/// A frontend message that cannot be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// Strings travel NUL-terminated, so they cannot contain one.
    #[error("string contains a NUL byte")]
    NullByte,
    /// Bind counts parameters in an Int16.
    #[error("{0} parameters given, at most {max} are allowed", max = i16::MAX)]
    TooManyParameters(usize),
}
