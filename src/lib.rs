pub mod core;

// Re-export main types for convenience
pub use core::{
    ContentInterpreter, Diagnostics, LoadOptions, MemorySource, ObjectStore, OpCode, Operand,
    OperatorList, PDFDocument, PDFError, PDFObject, PDFResult, Ref, WarningKind, XRef, XRefEntry,
};
