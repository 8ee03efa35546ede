use super::error::PDFError;
use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

/// Category of a recoverable problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WarningKind {
    MissingObject,
    MalformedObject,
    UnsupportedFilter,
    UnknownOperator,
    OperandArityMismatch,
    TruncatedStream,
    /// The cross-reference table was rebuilt by scanning the file.
    XRefRepaired,
    /// Range requests were abandoned in favor of sequential reading.
    RangeFallback,
    /// A named resource is absent from every enclosing resource dictionary.
    MissingResource,
    Other,
}

impl WarningKind {
    pub fn from_error(err: &PDFError) -> Self {
        match err {
            PDFError::MissingObject(_) => WarningKind::MissingObject,
            PDFError::MalformedObject(_) => WarningKind::MalformedObject,
            PDFError::UnsupportedFilter(_) => WarningKind::UnsupportedFilter,
            PDFError::UnknownOperator(_) => WarningKind::UnknownOperator,
            PDFError::OperandArityMismatch { .. } => WarningKind::OperandArityMismatch,
            PDFError::TruncatedStream(_) => WarningKind::TruncatedStream,
            PDFError::RangeRequestRejectedMidStream(_) => WarningKind::RangeFallback,
            _ => WarningKind::Other,
        }
    }
}

/// A recoverable problem recorded instead of being raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

/// Shared, append-only warning channel.
///
/// Cloning yields another handle onto the same list, so the object store,
/// the chunk manager and every interpreter of a document report into one
/// place. Each warning is also emitted through `log::warn!`.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    warnings: Arc<Mutex<Vec<Warning>>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&self, kind: WarningKind, message: impl Into<String>) {
        let message = message.into();
        warn!("{:?}: {}", kind, message);
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Warning { kind, message });
    }

    /// Records a recoverable error.
    pub fn report(&self, err: &PDFError) {
        self.warn(WarningKind::from_error(err), err.to_string());
    }

    pub fn warnings(&self) -> Vec<Warning> {
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of warnings recorded so far. Used as a watermark by
    /// [`since`](Self::since).
    pub fn len(&self) -> usize {
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Warnings recorded after the given watermark.
    pub fn since(&self, mark: usize) -> Vec<Warning> {
        let warnings = self.warnings.lock().unwrap_or_else(PoisonError::into_inner);
        warnings.iter().skip(mark).cloned().collect()
    }

    pub fn count(&self, kind: WarningKind) -> usize {
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|w| w.kind == kind)
            .count()
    }

    pub fn has(&self, kind: WarningKind) -> bool {
        self.count(kind) > 0
    }
}
