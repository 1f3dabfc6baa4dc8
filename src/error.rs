use std::{error::Error, fmt};

use backtrace::Backtrace;

/// The closed set of error conditions the engine can report, grouped by
/// the layer that raises them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    // i/o
    IoError,
    FileNotFound,
    WriteProtected,
    NetworkError,

    // file format
    InvalidFileHeader,
    InvalidFileVersion,
    InvalidPageSize,
    IntegrityViolated,
    LogInvalidFileHeader,

    // parameters
    InvalidParameter,
    InvalidKeySize,
    InvalidRecordSize,
    LimitsReached,
    NotImplemented,

    // visibility / control flow
    KeyNotFound,
    KeyErasedInTxn,
    DuplicateKey,
    TxnConflict,
    CursorIsNil,
    CursorStillOpen,
    TxnStillOpen,
    NeedRecovery,
    DatabaseNotFound,
    DatabaseAlreadyExists,
    DatabaseAlreadyOpen,
    EnvironmentAlreadyOpen,
    BlobNotFound,
    WouldBlock,
    NotReady,
    AlreadyInitialized,
}

impl ErrorKind {
    /// Control-flow errors are part of the normal API contract and leave
    /// the engine fully consistent.
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            ErrorKind::KeyNotFound
                | ErrorKind::KeyErasedInTxn
                | ErrorKind::DuplicateKey
                | ErrorKind::TxnConflict
                | ErrorKind::CursorIsNil
        )
    }
}

pub struct BurrowError {
    kind: ErrorKind,
    details: String,
    backtrace: Option<Backtrace>,
}

impl BurrowError {
    pub fn new(kind: ErrorKind, msg: &str) -> Self {
        Self {
            kind,
            details: msg.to_string(),
            backtrace: Some(Backtrace::new_unresolved()),
        }
    }

    /// Cheap constructor for control-flow errors; no message, no
    /// backtrace capture.
    pub fn of(kind: ErrorKind) -> Self {
        Self {
            kind,
            details: String::new(),
            backtrace: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn details(&self) -> &str {
        &self.details
    }
}

impl fmt::Display for BurrowError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.details.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            write!(f, "{:?}: {}", self.kind, self.details)
        }
    }
}

impl fmt::Debug for BurrowError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)?;
        if let Some(bt) = &self.backtrace {
            write!(f, "\n{:?}", bt)?;
        }
        Ok(())
    }
}

impl Error for BurrowError {}

impl From<std::io::Error> for BurrowError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::WriteProtected,
            _ => ErrorKind::IoError,
        };
        BurrowError::new(kind, &e.to_string())
    }
}

pub type BurrowResult<T> = Result<T, BurrowError>;

/// Shorthand for operations which only signal success or failure.
pub type DbResult = BurrowResult<()>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_flow_kinds() {
        assert!(ErrorKind::KeyNotFound.is_control_flow());
        assert!(ErrorKind::TxnConflict.is_control_flow());
        assert!(!ErrorKind::IoError.is_control_flow());
        assert!(!ErrorKind::IntegrityViolated.is_control_flow());
    }

    #[test]
    fn test_display() {
        let e = BurrowError::of(ErrorKind::KeyNotFound);
        assert_eq!(format!("{}", e), "KeyNotFound");

        let e = BurrowError::new(ErrorKind::IoError, "short read");
        assert_eq!(format!("{}", e), "IoError: short read");
    }
}
