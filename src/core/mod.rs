pub mod base_stream;
pub mod byte_source;
pub mod chunk_manager;
pub mod chunked_stream;
pub mod config;
pub mod content_stream;
pub mod crypto;
pub mod decode;
pub mod diagnostics;
pub mod document;
pub mod encryption;
pub mod error;
pub mod evaluator;
pub mod filter;
#[cfg(feature = "network")]
pub mod http_source;
pub mod lexer;
pub mod message_handler;
pub mod object_store;
pub mod page;
pub mod parser;
pub mod pending;
pub mod primitives;
pub mod resources;
pub mod retry;
pub mod stream;
pub mod worker;
pub mod xref;

pub use base_stream::BaseStream;
pub use byte_source::{ByteSource, FileSource, MemorySource, ProgressData};
pub use chunked_stream::{ChunkedStream, ChunkedStreamManager};
pub use config::LoadOptions;
pub use content_stream::{OpCode, Operand, Operation, OperatorList};
pub use diagnostics::{Diagnostics, Warning, WarningKind};
pub use document::{PDFDocument, PageTask};
pub use error::{ErrorLevel, PDFError, PDFResult};
pub use evaluator::{ContentInterpreter, InterpreterState, Step};
pub use filter::{DecodedStream, FilterChain, FilterRegistry, StreamFilter};
#[cfg(feature = "network")]
pub use http_source::HttpSource;
pub use lexer::{Lexer, Token};
pub use message_handler::{Message, MessageHandler, MessageKind, Transport};
pub use object_store::{ObjectStore, StoreStats};
pub use page::{Page, PageInfo};
pub use parser::Parser;
pub use pending::{Awaiter, PendingRegistry, PendingState, PendingValue};
pub use primitives::{Dict, PDFObject, Ref, StreamObject};
pub use resources::{Resource, ResourceKind};
pub use stream::Stream;
pub use worker::{OpenParams, OpenSource, WorkerDocument, WorkerHost};
pub use xref::{XRef, XRefEntry};
