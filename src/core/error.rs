use super::primitives::Ref;
use thiserror::Error;

/// Universal error type for PDF operations.
///
/// Errors are `Clone` because a settled [`PendingValue`](super::pending::PendingValue)
/// hands a copy of its outcome to every awaiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PDFError {
    // ------------------------------------------------------------------
    // Internal signals consumed by the progressive-loading drivers
    // ------------------------------------------------------------------
    /// End of stream reached unexpectedly
    #[error("Unexpected end of stream")]
    UnexpectedEndOfStream,

    /// Invalid byte range requested
    #[error("Invalid byte range: {begin}..{end}")]
    InvalidByteRange { begin: usize, end: usize },

    /// Invalid stream position
    #[error("Invalid position {pos} for stream of length {length}")]
    InvalidPosition { pos: usize, length: usize },

    /// The bytes `position..position + length` are not loaded yet.
    ///
    /// Raised by synchronous parsing code; callers await
    /// `ensure_range` and retry the operation.
    #[error("Data missing at {position} (length {length})")]
    DataMissing { position: usize, length: usize },

    /// Parsing needs an object that is not in the cache yet (indirect `/Length`).
    #[error("Object {0} is not resolved yet")]
    ObjectPending(Ref),

    // ------------------------------------------------------------------
    // Document level: abort open
    // ------------------------------------------------------------------
    #[error("Invalid PDF structure: {0}")]
    InvalidDocument(String),

    #[error("Missing PDF: {0}")]
    MissingDocument(String),

    #[error("A password is required to open this document")]
    PasswordRequired,

    #[error("Incorrect password")]
    PasswordIncorrect,

    #[error("Unexpected end of file while locating trailer: {0}")]
    UnexpectedEofInTrailer(String),

    // ------------------------------------------------------------------
    // Object level: recovered locally as null/empty plus a warning
    // ------------------------------------------------------------------
    #[error("Missing object {0}")]
    MissingObject(Ref),

    #[error("Malformed object: {0}")]
    MalformedObject(String),

    #[error("Unsupported filter: {0}")]
    UnsupportedFilter(String),

    // ------------------------------------------------------------------
    // Content level: recovered locally in a degraded operator list
    // ------------------------------------------------------------------
    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    #[error("Operator {op} expects {expected} operands, got {got}")]
    OperandArityMismatch {
        op: String,
        expected: usize,
        got: usize,
    },

    #[error("Truncated stream: {0}")]
    TruncatedStream(String),

    // ------------------------------------------------------------------
    // Transport level
    // ------------------------------------------------------------------
    #[error("Source unreachable: {0}")]
    Unreachable(String),

    #[error("Range request rejected: {0}")]
    RangeRequestRejectedMidStream(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Stream operation failed
    #[error("Stream error: {0}")]
    StreamError(String),

    /// Generic error with message
    #[error("{0}")]
    Generic(String),
}

/// Coarse classification of [`PDFError`] used by the recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorLevel {
    /// Fatal for the whole document; surfaced from open.
    Document,
    /// Recovered by resolving to null/empty with a warning.
    Object,
    /// Recovered by producing a degraded operator list.
    Content,
    /// Failure of the byte source.
    Transport,
    /// Control-flow signals and programming errors.
    Internal,
}

impl PDFError {
    pub fn level(&self) -> ErrorLevel {
        match self {
            PDFError::InvalidDocument(_)
            | PDFError::MissingDocument(_)
            | PDFError::PasswordRequired
            | PDFError::PasswordIncorrect
            | PDFError::UnexpectedEofInTrailer(_) => ErrorLevel::Document,

            PDFError::MissingObject(_)
            | PDFError::MalformedObject(_)
            | PDFError::UnsupportedFilter(_) => ErrorLevel::Object,

            PDFError::UnknownOperator(_)
            | PDFError::OperandArityMismatch { .. }
            | PDFError::TruncatedStream(_) => ErrorLevel::Content,

            PDFError::Unreachable(_)
            | PDFError::RangeRequestRejectedMidStream(_)
            | PDFError::Cancelled(_)
            | PDFError::StreamError(_) => ErrorLevel::Transport,

            PDFError::UnexpectedEndOfStream
            | PDFError::InvalidByteRange { .. }
            | PDFError::InvalidPosition { .. }
            | PDFError::DataMissing { .. }
            | PDFError::ObjectPending(_)
            | PDFError::Generic(_) => ErrorLevel::Internal,
        }
    }

    /// True for the retry signals raised while data is still arriving.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PDFError::DataMissing { .. } | PDFError::ObjectPending(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PDFError::Cancelled(_))
    }

    /// Stable name used when an error crosses the worker boundary.
    pub fn code(&self) -> &'static str {
        match self {
            PDFError::UnexpectedEndOfStream => "UnexpectedEndOfStream",
            PDFError::InvalidByteRange { .. } => "InvalidByteRange",
            PDFError::InvalidPosition { .. } => "InvalidPosition",
            PDFError::DataMissing { .. } => "DataMissing",
            PDFError::ObjectPending(_) => "ObjectPending",
            PDFError::InvalidDocument(_) => "InvalidDocument",
            PDFError::MissingDocument(_) => "MissingDocument",
            PDFError::PasswordRequired => "PasswordRequired",
            PDFError::PasswordIncorrect => "PasswordIncorrect",
            PDFError::UnexpectedEofInTrailer(_) => "UnexpectedEofInTrailer",
            PDFError::MissingObject(_) => "MissingObject",
            PDFError::MalformedObject(_) => "MalformedObject",
            PDFError::UnsupportedFilter(_) => "UnsupportedFilter",
            PDFError::UnknownOperator(_) => "UnknownOperator",
            PDFError::OperandArityMismatch { .. } => "OperandArityMismatch",
            PDFError::TruncatedStream(_) => "TruncatedStream",
            PDFError::Unreachable(_) => "Unreachable",
            PDFError::RangeRequestRejectedMidStream(_) => "RangeRequestRejectedMidStream",
            PDFError::Cancelled(_) => "Cancelled",
            PDFError::StreamError(_) => "StreamError",
            PDFError::Generic(_) => "Generic",
        }
    }

    /// Rebuilds an error received from the other side of a transport.
    ///
    /// Variants with structured payloads that cannot be rebuilt from a message
    /// collapse to [`PDFError::Generic`].
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            "InvalidDocument" => PDFError::InvalidDocument(message),
            "MissingDocument" => PDFError::MissingDocument(message),
            "PasswordRequired" => PDFError::PasswordRequired,
            "PasswordIncorrect" => PDFError::PasswordIncorrect,
            "UnexpectedEofInTrailer" => PDFError::UnexpectedEofInTrailer(message),
            "MalformedObject" => PDFError::MalformedObject(message),
            "UnsupportedFilter" => PDFError::UnsupportedFilter(message),
            "UnknownOperator" => PDFError::UnknownOperator(message),
            "TruncatedStream" => PDFError::TruncatedStream(message),
            "Unreachable" => PDFError::Unreachable(message),
            "RangeRequestRejectedMidStream" => PDFError::RangeRequestRejectedMidStream(message),
            "Cancelled" => PDFError::Cancelled(message),
            "StreamError" => PDFError::StreamError(message),
            _ => PDFError::Generic(message),
        }
    }

    /// The human readable part of the error, without the variant prefix
    /// added by `Display` where one exists.
    pub fn message(&self) -> String {
        match self {
            PDFError::InvalidDocument(m)
            | PDFError::MissingDocument(m)
            | PDFError::UnexpectedEofInTrailer(m)
            | PDFError::MalformedObject(m)
            | PDFError::UnsupportedFilter(m)
            | PDFError::UnknownOperator(m)
            | PDFError::TruncatedStream(m)
            | PDFError::Unreachable(m)
            | PDFError::RangeRequestRejectedMidStream(m)
            | PDFError::Cancelled(m)
            | PDFError::StreamError(m)
            | PDFError::Generic(m) => m.clone(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for PDFError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => PDFError::MissingDocument(err.to_string()),
            std::io::ErrorKind::UnexpectedEof => PDFError::UnexpectedEndOfStream,
            _ => PDFError::Unreachable(err.to_string()),
        }
    }
}

/// Result type alias for PDF operations
pub type PDFResult<T> = Result<T, PDFError>;

impl From<serde_json::Error> for PDFError {
    fn from(err: serde_json::Error) -> Self {
        PDFError::Generic(format!("Invalid message payload: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        assert_eq!(PDFError::PasswordRequired.level(), ErrorLevel::Document);
        assert_eq!(
            PDFError::MissingObject(Ref::new(3, 0)).level(),
            ErrorLevel::Object
        );
        assert_eq!(
            PDFError::TruncatedStream("string".into()).level(),
            ErrorLevel::Content
        );
        assert_eq!(
            PDFError::Cancelled("page closed".into()).level(),
            ErrorLevel::Transport
        );
        assert!(
            PDFError::DataMissing {
                position: 10,
                length: 4
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_code_round_trip_keeps_kind() {
        let err = PDFError::InvalidDocument("no catalog".into());
        let rebuilt = PDFError::from_code(err.code(), err.message());
        assert_eq!(rebuilt, err);

        let rebuilt = PDFError::from_code("PasswordIncorrect", "ignored");
        assert_eq!(rebuilt, PDFError::PasswordIncorrect);

        let rebuilt = PDFError::from_code("SomethingNew", "oops");
        assert_eq!(rebuilt, PDFError::Generic("oops".into()));
    }

    #[test]
    fn test_display() {
        let err = PDFError::OperandArityMismatch {
            op: "re".into(),
            expected: 4,
            got: 2,
        };
        assert_eq!(err.to_string(), "Operator re expects 4 operands, got 2");
        assert_eq!(
            PDFError::MissingObject(Ref::new(12, 1)).to_string(),
            "Missing object 12 1 R"
        );
    }
}
