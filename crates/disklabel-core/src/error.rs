//! Disklabel error types

use thiserror::Error;

/// The main error type for partition table operations
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error while talking to the device
    #[error("Device I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid argument combination passed by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not allowed in the current context state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// No device is assigned to the context
    #[error("No device assigned")]
    NoDevice,

    /// No label is active on the context
    #[error("No disklabel")]
    NoLabel,

    /// The device (or context) is read-only or in list-only mode
    #[error("Read-only: {0}")]
    ReadOnly(String),

    /// Corrupt or inconsistent on-disk label structure
    #[error("Invalid disklabel: {0}")]
    InvalidLabel(String),

    /// Checksum verification failed
    #[error("Checksum verification failed: {0}")]
    ChecksumVerification(String),

    /// A value is outside the permitted range
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// No free space (or no free slot) left for the request
    #[error("No free space: {0}")]
    NoSpace(String),

    /// Duplicate partition number or identifier
    #[error("Already exists: {0}")]
    Duplicate(String),

    /// Partition type not known to the label
    #[error("Unknown partition type: {0}")]
    UnknownType(String),

    /// Partition, label, header or field not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation is not implemented by the active label
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The dialog handler declined to answer
    #[error("Aborted: {0}")]
    Aborted(String),

    /// Script parse error
    #[error("Script line {line}: {message}")]
    Script { line: usize, message: String },
}

/// Result type alias for disklabel operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Error::InvalidOperation(msg.into())
    }

    /// Create a read-only error
    pub fn read_only(msg: impl Into<String>) -> Self {
        Error::ReadOnly(msg.into())
    }

    /// Create an invalid label error
    pub fn invalid_label(msg: impl Into<String>) -> Self {
        Error::InvalidLabel(msg.into())
    }

    /// Create an out of range error
    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Error::OutOfRange(msg.into())
    }

    /// Create a no space error
    pub fn no_space(msg: impl Into<String>) -> Self {
        Error::NoSpace(msg.into())
    }

    /// Create a duplicate error
    pub fn duplicate(msg: impl Into<String>) -> Self {
        Error::Duplicate(msg.into())
    }

    /// Create an unknown type error
    pub fn unknown_type(msg: impl Into<String>) -> Self {
        Error::UnknownType(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create an unsupported error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Create an aborted error
    pub fn aborted(msg: impl Into<String>) -> Self {
        Error::Aborted(msg.into())
    }

    /// Create a script parse error for the given line
    pub fn script(line: usize, msg: impl Into<String>) -> Self {
        Error::Script {
            line,
            message: msg.into(),
        }
    }

    /// True for usage errors: the caller asked for something the API cannot do
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_) | Error::InvalidOperation(_) | Error::NoDevice | Error::NoLabel
        )
    }

    /// True for constraint errors: the request conflicts with the table or geometry
    pub fn is_constraint(&self) -> bool {
        matches!(
            self,
            Error::OutOfRange(_)
                | Error::NoSpace(_)
                | Error::Duplicate(_)
                | Error::UnknownType(_)
                | Error::NotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::script(7, "unknown field 'foo'");
        assert_eq!(err.to_string(), "Script line 7: unknown field 'foo'");
        assert_eq!(Error::NoLabel.to_string(), "No disklabel");
    }

    #[test]
    fn test_error_classes() {
        assert!(Error::NoDevice.is_usage());
        assert!(Error::duplicate("partition 1").is_constraint());
        assert!(!Error::aborted("no").is_constraint());
    }
}
