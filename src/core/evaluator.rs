//! Compiles content streams into operator lists.
//!
//! [`ContentInterpreter`] is a resumable state machine. [`step`] reads and
//! compiles one operator; when the operator names a resource that is not
//! loaded yet, compilation suspends and `step` hands back an
//! [`Awaiter`] on the load. The interpreter holds its own awaiter while
//! suspended, so the load survives other waiters giving up. [`resume`] takes that value's outcome and
//! emits the operator at exactly the position it was read, so the output
//! order never depends on the order resources arrive in.
//!
//! [`step`]: ContentInterpreter::step
//! [`resume`]: ContentInterpreter::resume

use super::content_stream::{
    normalize_operands, ContentTokenizer, OpCode, Operand, Operation, OperatorList, RawOperation,
};
use super::diagnostics::{Diagnostics, WarningKind};
use super::error::{PDFError, PDFResult};
use super::filter::FilterChain;
use super::pending::Awaiter;
use super::primitives::{Dict, PDFObject, Ref};
use super::resources::{
    is_builtin_color_space, Lookup, Resource, ResourceKind, ResourceResolver, ResourceScope,
};
use bytes::Bytes;
use indexmap::IndexMap;
use log::{debug, trace};
use std::sync::Arc;

/// Abbreviated inline image keys and their full names.
const INLINE_IMAGE_KEYS: [(&str, &str); 10] = [
    ("BPC", "BitsPerComponent"),
    ("CS", "ColorSpace"),
    ("D", "Decode"),
    ("DP", "DecodeParms"),
    ("F", "Filter"),
    ("H", "Height"),
    ("IM", "ImageMask"),
    ("I", "Interpolate"),
    ("W", "Width"),
    ("L", "Length"),
];

/// Where the interpreter is.
#[derive(Debug, Clone, PartialEq)]
pub enum InterpreterState {
    Idle,
    /// Reading the next operator group.
    Tokenizing,
    /// Translating a group into an operation.
    Compiling,
    /// Waiting for pending value `on`; its operation goes to index `at`.
    Suspended { on: String, at: usize },
    Complete,
    Failed(PDFError),
}

/// Result of one [`ContentInterpreter::step`].
#[derive(Debug)]
pub enum Step {
    /// Progress was made; step again.
    Continue,
    /// Waiting on a resource: settle it, then call `resume`.
    Suspended(Awaiter<Arc<Resource>>),
    /// Compilation finished (or failed, see the state).
    Done,
}

/// What to emit once a suspended resource arrives.
#[derive(Debug)]
enum Continuation {
    /// Emit `op` with `args[slot]` replaced by the resource id. Without the
    /// resource, emit the fallback args or skip when there are none.
    Emit {
        op: OpCode,
        args: Vec<Operand>,
        slot: usize,
        fallback: Option<Vec<Operand>>,
    },
    /// `Do`: image or form, decided by the resource.
    PaintXObject { name: String },
    /// Inline image waiting for its named color space.
    InlineImage {
        dict: IndexMap<String, Operand>,
        data: Bytes,
    },
}

struct Suspension {
    awaiter: Awaiter<Arc<Resource>>,
    kind: ResourceKind,
    name: String,
    continuation: Continuation,
}

/// A content stream being read: the page's own or a form's.
struct Frame {
    tokenizer: ContentTokenizer,
    /// The form XObject drawn by this frame.
    form: Option<FormFrame>,
    /// Depth of `BX`/`EX` nesting.
    compat_depth: usize,
    /// Lexer position of the last malformed token, for progress checks.
    last_error_at: Option<usize>,
}

struct FormFrame {
    reference: Option<Ref>,
    pushed_scope: bool,
}

/// Compiles one page's content (and the forms it draws) into an
/// [`OperatorList`].
pub struct ContentInterpreter {
    state: InterpreterState,
    frames: Vec<Frame>,
    scope: ResourceScope,
    resolver: Arc<ResourceResolver>,
    list: OperatorList,
    suspension: Option<Suspension>,
    max_form_depth: usize,
    diagnostics: Diagnostics,
    label: String,
}

impl ContentInterpreter {
    /// Prepares to compile `content` with `scope` as the page resources.
    pub fn new(
        content: Bytes,
        scope: ResourceScope,
        resolver: Arc<ResourceResolver>,
        max_form_depth: usize,
        diagnostics: Diagnostics,
    ) -> Self {
        let mut interpreter = ContentInterpreter {
            state: InterpreterState::Idle,
            frames: Vec::new(),
            scope,
            resolver,
            list: OperatorList::new(),
            suspension: None,
            max_form_depth,
            diagnostics,
            label: "content".to_string(),
        };
        match ContentTokenizer::new(content) {
            Ok(tokenizer) => interpreter.frames.push(Frame::new(tokenizer, None)),
            Err(err) => interpreter.truncated(&err),
        }
        interpreter
    }

    /// Names the content in log messages, e.g. `page 3`.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn state(&self) -> &InterpreterState {
        &self.state
    }

    /// Operations emitted so far.
    pub fn operator_list(&self) -> &OperatorList {
        &self.list
    }

    /// Advances by one operator.
    pub fn step(&mut self) -> Step {
        match self.state {
            InterpreterState::Complete | InterpreterState::Failed(_) => return Step::Done,
            InterpreterState::Suspended { .. } => {
                if let Some(suspension) = &self.suspension {
                    return Step::Suspended(suspension.awaiter.clone());
                }
                self.state = InterpreterState::Tokenizing;
            }
            InterpreterState::Idle | InterpreterState::Compiling => {
                self.state = InterpreterState::Tokenizing;
            }
            InterpreterState::Tokenizing => {}
        }

        let Some(frame) = self.frames.last_mut() else {
            self.state = InterpreterState::Complete;
            return Step::Done;
        };

        match frame.tokenizer.next_operation() {
            Ok(Some(raw)) => {
                self.state = InterpreterState::Compiling;
                self.compile(raw);
                if let Some(suspension) = &self.suspension {
                    self.state = InterpreterState::Suspended {
                        on: suspension.awaiter.id().to_string(),
                        at: self.list.len(),
                    };
                    return Step::Suspended(suspension.awaiter.clone());
                }
                self.state = InterpreterState::Tokenizing;
                Step::Continue
            }
            Ok(None) => {
                self.end_frame();
                Step::Continue
            }
            Err(PDFError::MalformedObject(message)) => {
                let position = frame.tokenizer.position();
                if frame.last_error_at == Some(position) {
                    self.truncated(&PDFError::TruncatedStream(message));
                    self.end_frame();
                } else {
                    frame.last_error_at = Some(position);
                    frame.tokenizer.discard_operands();
                    self.warn(WarningKind::MalformedObject, message);
                }
                Step::Continue
            }
            Err(err) => {
                self.truncated(&err);
                self.end_frame();
                Step::Continue
            }
        }
    }

    /// Supplies the outcome of the value the interpreter is suspended on.
    pub fn resume(&mut self, outcome: PDFResult<Arc<Resource>>) -> PDFResult<()> {
        let Some(suspension) = self.suspension.take() else {
            return Err(PDFError::Generic(format!(
                "resume called while {:?}",
                self.state
            )));
        };

        match outcome {
            Ok(resource) => self.apply(suspension.continuation, resource),
            Err(err) if err.is_cancelled() => {
                self.fail(err.clone());
                return Err(err);
            }
            Err(err) => {
                self.warn(
                    WarningKind::MissingResource,
                    format!(
                        "{} resource {} could not be loaded: {}",
                        suspension.kind, suspension.name, err
                    ),
                );
                self.apply_fallback(suspension.continuation);
            }
        }
        self.state = InterpreterState::Tokenizing;
        Ok(())
    }

    /// Drives the interpreter to completion, waiting on resources as they
    /// are needed.
    pub async fn run(mut self) -> PDFResult<Arc<OperatorList>> {
        loop {
            match self.step() {
                Step::Continue => {}
                Step::Suspended(awaiter) => {
                    let outcome = awaiter.wait().await;
                    self.resume(outcome)?;
                }
                Step::Done => break,
            }
        }
        self.finish()
    }

    /// The compiled list; fails if the interpreter failed.
    pub fn finish(self) -> PDFResult<Arc<OperatorList>> {
        match self.state {
            InterpreterState::Failed(err) => Err(err),
            InterpreterState::Complete => {
                debug!(
                    "Compiled {}: {} operations, {} resources",
                    self.label,
                    self.list.len(),
                    self.list.dependencies().len()
                );
                Ok(Arc::new(self.list))
            }
            state => Err(PDFError::Generic(format!(
                "{} is not compiled yet ({:?})",
                self.label, state
            ))),
        }
    }

    /// Marks the interpreter failed, e.g. when the document is cancelled.
    pub fn fail(&mut self, err: PDFError) {
        self.suspension = None;
        self.frames.clear();
        self.state = InterpreterState::Failed(err);
    }

    // ------------------------------------------------------------------
    // Compilation
    // ------------------------------------------------------------------

    fn compile(&mut self, raw: RawOperation) {
        let RawOperation { command, mut args } = raw;
        let Some(op) = OpCode::from_command(&command) else {
            if self.in_compat_section() {
                trace!("Ignoring {} inside BX/EX", command);
            } else {
                self.warn(
                    WarningKind::UnknownOperator,
                    format!("unknown operator '{}' in {}", command, self.label),
                );
            }
            return;
        };

        let got = args.len();
        if let Some(expected) = normalize_operands(op, &mut args) {
            let err = PDFError::OperandArityMismatch {
                op: op.to_string(),
                expected,
                got,
            };
            self.warn(WarningKind::OperandArityMismatch, format!("{} in {}", err, self.label));
        }

        match op {
            OpCode::BeginCompat => {
                self.with_frame(|frame| frame.compat_depth += 1);
                self.emit(op, Vec::new());
            }
            OpCode::EndCompat => {
                self.with_frame(|frame| frame.compat_depth = frame.compat_depth.saturating_sub(1));
                self.emit(op, Vec::new());
            }
            OpCode::SetFont => {
                let args = convert(&args);
                let fallback = Some(with_null(&args, 0));
                self.named(op, args, 0, ResourceKind::Font, fallback);
            }
            OpCode::PaintXObject => {
                let Some(name) = args[0].as_name().map(str::to_string) else {
                    self.warn(WarningKind::MalformedObject, format!("Do without a name in {}", self.label));
                    return;
                };
                self.request(
                    ResourceKind::XObject,
                    &name,
                    Continuation::PaintXObject { name: name.clone() },
                );
            }
            OpCode::SetGState | OpCode::ShadingFill => {
                let kind = if op == OpCode::SetGState {
                    ResourceKind::ExtGState
                } else {
                    ResourceKind::Shading
                };
                self.named(op, convert(&args), 0, kind, None);
            }
            OpCode::SetFillColorSpace | OpCode::SetStrokeColorSpace => {
                let args = convert(&args);
                match args[0].as_name() {
                    Some(name) if is_builtin_color_space(name) => self.emit(op, args),
                    _ => {
                        let fallback = Some(args.clone());
                        self.named(op, args, 0, ResourceKind::ColorSpace, fallback);
                    }
                }
            }
            OpCode::SetFillColorN | OpCode::SetStrokeColorN => {
                let args = convert(&args);
                match args.last() {
                    Some(Operand::Name(_)) => {
                        let slot = args.len() - 1;
                        let fallback = Some(args.clone());
                        self.named(op, args, slot, ResourceKind::Pattern, fallback);
                    }
                    _ => self.emit(op, args),
                }
            }
            OpCode::BeginMarkedContentProps | OpCode::MarkPointProps => {
                let args = convert(&args);
                if matches!(args[1], Operand::Name(_)) {
                    let fallback = Some(with_null(&args, 1));
                    self.named(op, args, 1, ResourceKind::Properties, fallback);
                } else {
                    self.emit(op, args);
                }
            }
            OpCode::EndInlineImage => self.inline_image(&args[0]),
            _ => self.emit(op, convert(&args)),
        }
    }

    /// Compiles an operator whose operand at `slot` names a resource.
    fn named(
        &mut self,
        op: OpCode,
        args: Vec<Operand>,
        slot: usize,
        kind: ResourceKind,
        fallback: Option<Vec<Operand>>,
    ) {
        let Some(name) = args[slot].as_name().map(str::to_string) else {
            self.warn(
                WarningKind::MalformedObject,
                format!("operator {} has no resource name in {}", op, self.label),
            );
            if let Some(fallback) = fallback {
                self.emit(op, fallback);
            }
            return;
        };
        self.request(
            kind,
            &name,
            Continuation::Emit {
                op,
                args,
                slot,
                fallback,
            },
        );
    }

    /// Looks `name` up and either applies the continuation now or suspends.
    fn request(&mut self, kind: ResourceKind, name: &str, continuation: Continuation) {
        let Some(value) = self.scope.lookup(kind, name).cloned() else {
            self.warn(
                WarningKind::MissingResource,
                format!("{} resource {} is not defined in {}", kind, name, self.label),
            );
            self.apply_fallback(continuation);
            return;
        };

        match self.resolver.request(kind, name, &value) {
            Lookup::Ready(resource) => self.apply(continuation, resource),
            Lookup::Pending(awaiter) => {
                self.suspension = Some(Suspension {
                    awaiter,
                    kind,
                    name: name.to_string(),
                    continuation,
                });
            }
        }
    }

    fn apply(&mut self, continuation: Continuation, resource: Arc<Resource>) {
        match continuation {
            Continuation::Emit {
                op, mut args, slot, ..
            } => {
                let id = self.list.add_resource(resource);
                args[slot] = Operand::Resource(id);
                self.emit(op, args);
            }
            Continuation::PaintXObject { name } => self.paint_xobject(&name, resource),
            Continuation::InlineImage { mut dict, data } => {
                let id = self.list.add_resource(resource);
                dict.insert("ColorSpace".to_string(), Operand::Resource(id));
                self.emit(
                    OpCode::PaintInlineImageXObject,
                    vec![Operand::Dict(dict), Operand::String(data)],
                );
            }
        }
    }

    fn apply_fallback(&mut self, continuation: Continuation) {
        match continuation {
            Continuation::Emit {
                op,
                fallback: Some(args),
                ..
            } => self.emit(op, args),
            Continuation::Emit { fallback: None, .. } | Continuation::PaintXObject { .. } => {}
            Continuation::InlineImage { dict, data } => self.emit(
                OpCode::PaintInlineImageXObject,
                vec![Operand::Dict(dict), Operand::String(data)],
            ),
        }
    }

    fn paint_xobject(&mut self, name: &str, resource: Arc<Resource>) {
        let Some(form) = resource.form.clone() else {
            let op = match resource.subtype.as_deref() {
                Some("Image") if resource.is_image_mask() => OpCode::PaintImageMaskXObject,
                Some("Image") => OpCode::PaintImageXObject,
                _ => OpCode::PaintXObject,
            };
            let id = self.list.add_resource(resource);
            self.emit(op, vec![Operand::Resource(id)]);
            return;
        };

        let forms: Vec<Option<Ref>> = self
            .frames
            .iter()
            .filter_map(|frame| frame.form.as_ref().map(|form| form.reference))
            .collect();
        if resource.reference.is_some() && forms.contains(&resource.reference) {
            self.warn(
                WarningKind::MalformedObject,
                format!("form {} draws itself in {}, skipped", name, self.label),
            );
            return;
        }
        if forms.len() >= self.max_form_depth {
            self.warn(
                WarningKind::MalformedObject,
                format!(
                    "form {} exceeds the nesting limit of {} in {}, skipped",
                    name, self.max_form_depth, self.label
                ),
            );
            return;
        }

        let tokenizer = match ContentTokenizer::new(form.content.clone()) {
            Ok(tokenizer) => tokenizer,
            Err(err) => {
                self.truncated(&err);
                return;
            }
        };

        self.list.add_resource(Arc::clone(&resource));
        let bbox = form.bbox.map_or(Operand::Null, |bbox| Operand::numbers(&bbox));
        self.emit(
            OpCode::PaintFormXObjectBegin,
            vec![Operand::numbers(&form.matrix), bbox],
        );

        let pushed_scope = match &form.resources {
            Some(frame) => {
                self.scope.push(Arc::clone(frame));
                true
            }
            None => false,
        };
        self.frames.push(Frame::new(
            tokenizer,
            Some(FormFrame {
                reference: resource.reference,
                pushed_scope,
            }),
        ));
    }

    fn inline_image(&mut self, image: &PDFObject) {
        let Some(stream) = image.as_stream() else {
            self.warn(WarningKind::MalformedObject, format!("EI without image data in {}", self.label));
            return;
        };

        let mut dict = Dict::with_capacity(stream.dict.len());
        for (key, value) in &stream.dict {
            let full = INLINE_IMAGE_KEYS
                .iter()
                .find(|(short, _)| *short == key.as_str())
                .map_or(key.as_str(), |(_, long)| long);
            dict.insert(full.to_string(), value.clone());
        }

        let registry = self.resolver.store().registry();
        let decoded = FilterChain::from_inline_dict(&dict).decode(&stream.raw, registry, None, &self.diagnostics);
        let mut operands = Operand::dict_from(&dict);
        operands.remove("Filter");
        operands.remove("DecodeParms");
        if let Some(encoding) = &decoded.encoding {
            operands.insert("Encoding".to_string(), Operand::Name(encoding.clone()));
        }

        match dict.get("ColorSpace") {
            Some(PDFObject::Name(name)) if !is_builtin_color_space(name) => {
                let name = name.clone();
                self.request(
                    ResourceKind::ColorSpace,
                    &name,
                    Continuation::InlineImage {
                        dict: operands,
                        data: decoded.bytes,
                    },
                );
            }
            _ => self.emit(
                OpCode::PaintInlineImageXObject,
                vec![Operand::Dict(operands), Operand::String(decoded.bytes)],
            ),
        }
    }

    // ------------------------------------------------------------------
    // Frames and bookkeeping
    // ------------------------------------------------------------------

    fn end_frame(&mut self) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        if let Some(form) = frame.form {
            if form.pushed_scope {
                self.scope.pop();
            }
            self.emit(OpCode::PaintFormXObjectEnd, Vec::new());
        }
        if self.frames.is_empty() {
            self.state = InterpreterState::Complete;
        } else {
            self.state = InterpreterState::Tokenizing;
        }
    }

    fn in_compat_section(&self) -> bool {
        self.frames.iter().any(|frame| frame.compat_depth > 0)
    }

    fn with_frame(&mut self, f: impl FnOnce(&mut Frame)) {
        if let Some(frame) = self.frames.last_mut() {
            f(frame);
        }
    }

    fn emit(&mut self, op: OpCode, args: Vec<Operand>) {
        self.list.push(Operation::new(op, args));
    }

    fn truncated(&mut self, err: &PDFError) {
        self.list.mark_incomplete();
        self.warn(
            WarningKind::TruncatedStream,
            format!("{} ends early after {} operations: {}", self.label, self.list.len(), err),
        );
    }

    fn warn(&mut self, kind: WarningKind, message: impl Into<String>) {
        let message = message.into();
        self.list.add_warning(kind, message.clone());
        self.diagnostics.warn(kind, message);
    }
}

impl Frame {
    fn new(tokenizer: ContentTokenizer, form: Option<FormFrame>) -> Self {
        Frame {
            tokenizer,
            form,
            compat_depth: 0,
            last_error_at: None,
        }
    }
}

fn convert(args: &[PDFObject]) -> Vec<Operand> {
    args.iter().map(Operand::from_object).collect()
}

fn with_null(args: &[Operand], slot: usize) -> Vec<Operand> {
    let mut args = args.to_vec();
    args[slot] = Operand::Null;
    args
}
