//! Content stream operators and compiled operator lists.
//!
//! A content stream is tokenized into `operands... operator` groups by
//! [`ContentTokenizer`]; the interpreter turns each group into an
//! [`Operation`] whose operands are plain values ([`Operand`]) with named
//! resources replaced by ids into the list's resource table.
//!
//! Operator codes follow the PDF.js OPS enumeration.

use super::diagnostics::{Warning, WarningKind};
use super::error::{PDFError, PDFResult};
use super::lexer::Lexer;
use super::parser::Parser;
use super::primitives::PDFObject;
use super::resources::Resource;
use super::stream::Stream;
use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// PDF content stream operator codes.
///
/// These map to the PDF operator names (like "m", "l", "cm", "Tj", etc.)
/// and follow the PDF.js OPS enumeration for compatibility.
///
/// We intentionally start from 1 so it's easy to spot bad operators (will be 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpCode {
    // Graphics State Operators
    /// w - Set line width
    SetLineWidth = 2,
    /// J - Set line cap style
    SetLineCap = 3,
    /// j - Set line join style
    SetLineJoin = 4,
    /// M - Set miter limit
    SetMiterLimit = 5,
    /// d - Set line dash pattern
    SetDash = 6,
    /// ri - Set rendering intent
    SetRenderingIntent = 7,
    /// i - Set flatness tolerance
    SetFlatness = 8,
    /// gs - Set graphics state from dictionary
    SetGState = 9,
    /// q - Save graphics state
    Save = 10,
    /// Q - Restore graphics state
    Restore = 11,
    /// cm - Concatenate matrix to current transformation matrix
    Transform = 12,

    // Path Construction Operators
    /// m - Begin new subpath
    MoveTo = 13,
    /// l - Append straight line segment
    LineTo = 14,
    /// c - Append cubic Bézier curve
    CurveTo = 15,
    /// v - Append cubic Bézier curve (initial point replicated)
    CurveTo2 = 16,
    /// y - Append cubic Bézier curve (final point replicated)
    CurveTo3 = 17,
    /// h - Close subpath
    ClosePath = 18,
    /// re - Append rectangle
    Rectangle = 19,

    // Path Painting Operators
    /// S - Stroke path
    Stroke = 20,
    /// s - Close and stroke path
    CloseStroke = 21,
    /// f or F - Fill path (nonzero winding rule)
    Fill = 22,
    /// f* - Fill path (even-odd rule)
    EOFill = 23,
    /// B - Fill and stroke path (nonzero winding rule)
    FillStroke = 24,
    /// B* - Fill and stroke path (even-odd rule)
    EOFillStroke = 25,
    /// b - Close, fill, and stroke path (nonzero winding rule)
    CloseFillStroke = 26,
    /// b* - Close, fill, and stroke path (even-odd rule)
    CloseEOFillStroke = 27,
    /// n - End path without filling or stroking
    EndPath = 28,

    // Clipping Path Operators
    /// W - Set clipping path (nonzero winding rule)
    Clip = 29,
    /// W* - Set clipping path (even-odd rule)
    EOClip = 30,

    // Text Object Operators
    /// BT - Begin text object
    BeginText = 31,
    /// ET - End text object
    EndText = 32,

    // Text State Operators
    /// Tc - Set character spacing
    SetCharSpacing = 33,
    /// Tw - Set word spacing
    SetWordSpacing = 34,
    /// Tz - Set horizontal scaling
    SetHScale = 35,
    /// TL - Set text leading
    SetLeading = 36,
    /// Tf - Set text font and size
    SetFont = 37,
    /// Tr - Set text rendering mode
    SetTextRenderingMode = 38,
    /// Ts - Set text rise
    SetTextRise = 39,

    // Text Positioning Operators
    /// Td - Move text position
    MoveText = 40,
    /// TD - Move text position and set leading
    SetLeadingMoveText = 41,
    /// Tm - Set text matrix
    SetTextMatrix = 42,
    /// T* - Move to start of next line
    NextLine = 43,

    // Text Showing Operators
    /// Tj - Show text string
    ShowText = 44,
    /// TJ - Show text with individual glyph positioning
    ShowSpacedText = 45,
    /// ' - Move to next line and show text
    NextLineShowText = 46,
    /// " - Set spacing, move to next line, show text
    NextLineSetSpacingShowText = 47,

    // Type 3 Font Operators
    /// d0 - Set glyph width
    SetCharWidth = 48,
    /// d1 - Set glyph width and bounding box
    SetCharWidthAndBounds = 49,

    // Color Operators
    /// CS - Set stroke color space
    SetStrokeColorSpace = 50,
    /// cs - Set fill color space
    SetFillColorSpace = 51,
    /// SC - Set stroke color
    SetStrokeColor = 52,
    /// SCN - Set stroke color (supports Pattern, Separation, DeviceN)
    SetStrokeColorN = 53,
    /// sc - Set fill color
    SetFillColor = 54,
    /// scn - Set fill color (supports Pattern, Separation, DeviceN)
    SetFillColorN = 55,
    /// G - Set stroke gray level
    SetStrokeGray = 56,
    /// g - Set fill gray level
    SetFillGray = 57,
    /// RG - Set stroke RGB color
    SetStrokeRGBColor = 58,
    /// rg - Set fill RGB color
    SetFillRGBColor = 59,
    /// K - Set stroke CMYK color
    SetStrokeCMYKColor = 60,
    /// k - Set fill CMYK color
    SetFillCMYKColor = 61,

    // Shading Operator
    /// sh - Paint with shading pattern
    ShadingFill = 62,

    // Inline Image Operators
    /// BI - Begin inline image
    BeginInlineImage = 63,
    /// ID - Begin inline image data
    BeginImageData = 64,
    /// EI - End inline image
    EndInlineImage = 65,

    // XObject Operator
    /// Do - Paint XObject
    PaintXObject = 66,

    // Marked Content Operators
    /// MP - Define marked-content point
    MarkPoint = 67,
    /// DP - Define marked-content point with properties
    MarkPointProps = 68,
    /// BMC - Begin marked-content sequence
    BeginMarkedContent = 69,
    /// BDC - Begin marked-content sequence with properties
    BeginMarkedContentProps = 70,
    /// EMC - End marked-content sequence
    EndMarkedContent = 71,

    // Compatibility Operators
    /// BX - Begin compatibility section
    BeginCompat = 72,
    /// EX - End compatibility section
    EndCompat = 73,

    // Produced by compilation, never read from a content stream
    /// Start of a form XObject: `[matrix, bbox]`
    PaintFormXObjectBegin = 74,
    /// End of the innermost form XObject
    PaintFormXObjectEnd = 75,
    /// Image XObject painted by `Do`: `[resource]`
    PaintImageXObject = 76,
    /// Decoded inline image: `[dict, data]`
    PaintInlineImageXObject = 77,
    /// Image XObject with `/ImageMask true`: `[resource]`
    PaintImageMaskXObject = 78,
}

impl OpCode {
    /// Converts a PDF operator string (command) to an OpCode.
    ///
    /// # Arguments
    /// * `cmd` - The operator string (e.g., "m", "l", "cm", "Tj")
    ///
    /// # Returns
    /// The corresponding OpCode, or `None` if the operator is unknown.
    pub fn from_command(cmd: &str) -> Option<OpCode> {
        match cmd {
            // Graphics state
            "w" => Some(OpCode::SetLineWidth),
            "J" => Some(OpCode::SetLineCap),
            "j" => Some(OpCode::SetLineJoin),
            "M" => Some(OpCode::SetMiterLimit),
            "d" => Some(OpCode::SetDash),
            "ri" => Some(OpCode::SetRenderingIntent),
            "i" => Some(OpCode::SetFlatness),
            "gs" => Some(OpCode::SetGState),
            "q" => Some(OpCode::Save),
            "Q" => Some(OpCode::Restore),
            "cm" => Some(OpCode::Transform),

            // Path construction
            "m" => Some(OpCode::MoveTo),
            "l" => Some(OpCode::LineTo),
            "c" => Some(OpCode::CurveTo),
            "v" => Some(OpCode::CurveTo2),
            "y" => Some(OpCode::CurveTo3),
            "h" => Some(OpCode::ClosePath),
            "re" => Some(OpCode::Rectangle),

            // Path painting
            "S" => Some(OpCode::Stroke),
            "s" => Some(OpCode::CloseStroke),
            "f" | "F" => Some(OpCode::Fill),
            "f*" => Some(OpCode::EOFill),
            "B" => Some(OpCode::FillStroke),
            "B*" => Some(OpCode::EOFillStroke),
            "b" => Some(OpCode::CloseFillStroke),
            "b*" => Some(OpCode::CloseEOFillStroke),
            "n" => Some(OpCode::EndPath),

            // Clipping
            "W" => Some(OpCode::Clip),
            "W*" => Some(OpCode::EOClip),

            // Text object
            "BT" => Some(OpCode::BeginText),
            "ET" => Some(OpCode::EndText),

            // Text state
            "Tc" => Some(OpCode::SetCharSpacing),
            "Tw" => Some(OpCode::SetWordSpacing),
            "Tz" => Some(OpCode::SetHScale),
            "TL" => Some(OpCode::SetLeading),
            "Tf" => Some(OpCode::SetFont),
            "Tr" => Some(OpCode::SetTextRenderingMode),
            "Ts" => Some(OpCode::SetTextRise),

            // Text positioning
            "Td" => Some(OpCode::MoveText),
            "TD" => Some(OpCode::SetLeadingMoveText),
            "Tm" => Some(OpCode::SetTextMatrix),
            "T*" => Some(OpCode::NextLine),

            // Text showing
            "Tj" => Some(OpCode::ShowText),
            "TJ" => Some(OpCode::ShowSpacedText),
            "'" => Some(OpCode::NextLineShowText),
            "\"" => Some(OpCode::NextLineSetSpacingShowText),

            // Type 3 fonts
            "d0" => Some(OpCode::SetCharWidth),
            "d1" => Some(OpCode::SetCharWidthAndBounds),

            // Color
            "CS" => Some(OpCode::SetStrokeColorSpace),
            "cs" => Some(OpCode::SetFillColorSpace),
            "SC" => Some(OpCode::SetStrokeColor),
            "SCN" => Some(OpCode::SetStrokeColorN),
            "sc" => Some(OpCode::SetFillColor),
            "scn" => Some(OpCode::SetFillColorN),
            "G" => Some(OpCode::SetStrokeGray),
            "g" => Some(OpCode::SetFillGray),
            "RG" => Some(OpCode::SetStrokeRGBColor),
            "rg" => Some(OpCode::SetFillRGBColor),
            "K" => Some(OpCode::SetStrokeCMYKColor),
            "k" => Some(OpCode::SetFillCMYKColor),

            // Shading
            "sh" => Some(OpCode::ShadingFill),

            // Inline images
            "BI" => Some(OpCode::BeginInlineImage),
            "ID" => Some(OpCode::BeginImageData),
            "EI" => Some(OpCode::EndInlineImage),

            // XObject
            "Do" => Some(OpCode::PaintXObject),

            // Marked content
            "MP" => Some(OpCode::MarkPoint),
            "DP" => Some(OpCode::MarkPointProps),
            "BMC" => Some(OpCode::BeginMarkedContent),
            "BDC" => Some(OpCode::BeginMarkedContentProps),
            "EMC" => Some(OpCode::EndMarkedContent),

            // Compatibility
            "BX" => Some(OpCode::BeginCompat),
            "EX" => Some(OpCode::EndCompat),

            _ => None,
        }
    }

    /// Returns the PDF operator string for this opcode.
    pub fn to_command(&self) -> &'static str {
        match self {
            OpCode::SetLineWidth => "w",
            OpCode::SetLineCap => "J",
            OpCode::SetLineJoin => "j",
            OpCode::SetMiterLimit => "M",
            OpCode::SetDash => "d",
            OpCode::SetRenderingIntent => "ri",
            OpCode::SetFlatness => "i",
            OpCode::SetGState => "gs",
            OpCode::Save => "q",
            OpCode::Restore => "Q",
            OpCode::Transform => "cm",
            OpCode::MoveTo => "m",
            OpCode::LineTo => "l",
            OpCode::CurveTo => "c",
            OpCode::CurveTo2 => "v",
            OpCode::CurveTo3 => "y",
            OpCode::ClosePath => "h",
            OpCode::Rectangle => "re",
            OpCode::Stroke => "S",
            OpCode::CloseStroke => "s",
            OpCode::Fill => "f",
            OpCode::EOFill => "f*",
            OpCode::FillStroke => "B",
            OpCode::EOFillStroke => "B*",
            OpCode::CloseFillStroke => "b",
            OpCode::CloseEOFillStroke => "b*",
            OpCode::EndPath => "n",
            OpCode::Clip => "W",
            OpCode::EOClip => "W*",
            OpCode::BeginText => "BT",
            OpCode::EndText => "ET",
            OpCode::SetCharSpacing => "Tc",
            OpCode::SetWordSpacing => "Tw",
            OpCode::SetHScale => "Tz",
            OpCode::SetLeading => "TL",
            OpCode::SetFont => "Tf",
            OpCode::SetTextRenderingMode => "Tr",
            OpCode::SetTextRise => "Ts",
            OpCode::MoveText => "Td",
            OpCode::SetLeadingMoveText => "TD",
            OpCode::SetTextMatrix => "Tm",
            OpCode::NextLine => "T*",
            OpCode::ShowText => "Tj",
            OpCode::ShowSpacedText => "TJ",
            OpCode::NextLineShowText => "'",
            OpCode::NextLineSetSpacingShowText => "\"",
            OpCode::SetCharWidth => "d0",
            OpCode::SetCharWidthAndBounds => "d1",
            OpCode::SetStrokeColorSpace => "CS",
            OpCode::SetFillColorSpace => "cs",
            OpCode::SetStrokeColor => "SC",
            OpCode::SetStrokeColorN => "SCN",
            OpCode::SetFillColor => "sc",
            OpCode::SetFillColorN => "scn",
            OpCode::SetStrokeGray => "G",
            OpCode::SetFillGray => "g",
            OpCode::SetStrokeRGBColor => "RG",
            OpCode::SetFillRGBColor => "rg",
            OpCode::SetStrokeCMYKColor => "K",
            OpCode::SetFillCMYKColor => "k",
            OpCode::ShadingFill => "sh",
            OpCode::BeginInlineImage => "BI",
            OpCode::BeginImageData => "ID",
            OpCode::EndInlineImage => "EI",
            OpCode::PaintXObject => "Do",
            OpCode::MarkPoint => "MP",
            OpCode::MarkPointProps => "DP",
            OpCode::BeginMarkedContent => "BMC",
            OpCode::BeginMarkedContentProps => "BDC",
            OpCode::EndMarkedContent => "EMC",
            OpCode::BeginCompat => "BX",
            OpCode::EndCompat => "EX",
            OpCode::PaintFormXObjectBegin => "paintFormXObjectBegin",
            OpCode::PaintFormXObjectEnd => "paintFormXObjectEnd",
            OpCode::PaintImageXObject => "paintImageXObject",
            OpCode::PaintInlineImageXObject => "paintInlineImageXObject",
            OpCode::PaintImageMaskXObject => "paintImageMaskXObject",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_command())
    }
}

/// Number of operands an operator takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(usize),
    /// Up to this many operands.
    Variable(usize),
}

impl OpCode {
    /// Operand count from the operator table.
    pub fn arity(&self) -> Arity {
        use OpCode::*;
        match self {
            Save | Restore | ClosePath | Stroke | CloseStroke | Fill | EOFill | FillStroke
            | EOFillStroke | CloseFillStroke | CloseEOFillStroke | EndPath | Clip | EOClip
            | BeginText | EndText | NextLine | BeginInlineImage | BeginImageData
            | EndMarkedContent | BeginCompat | EndCompat | PaintFormXObjectEnd => Arity::Fixed(0),

            SetLineWidth | SetLineCap | SetLineJoin | SetMiterLimit | SetRenderingIntent
            | SetFlatness | SetGState | SetCharSpacing | SetWordSpacing | SetHScale | SetLeading
            | SetTextRenderingMode | SetTextRise | ShowText | ShowSpacedText | NextLineShowText
            | SetStrokeColorSpace | SetFillColorSpace | SetStrokeGray | SetFillGray
            | ShadingFill | EndInlineImage | PaintXObject | MarkPoint | BeginMarkedContent
            | PaintImageXObject | PaintImageMaskXObject => Arity::Fixed(1),

            SetDash | MoveTo | LineTo | SetFont | MoveText | SetLeadingMoveText | SetCharWidth
            | MarkPointProps | BeginMarkedContentProps | PaintFormXObjectBegin
            | PaintInlineImageXObject => Arity::Fixed(2),

            NextLineSetSpacingShowText | SetStrokeRGBColor | SetFillRGBColor => Arity::Fixed(3),

            CurveTo2 | CurveTo3 | Rectangle | SetStrokeCMYKColor | SetFillCMYKColor => {
                Arity::Fixed(4)
            }

            Transform | CurveTo | SetTextMatrix | SetCharWidthAndBounds => Arity::Fixed(6),

            SetStrokeColor | SetFillColor => Arity::Variable(4),
            SetStrokeColorN | SetFillColorN => Arity::Variable(33),
        }
    }

    /// Operators that draw with a named resource.
    pub fn is_resource_operator(&self) -> bool {
        matches!(
            self,
            OpCode::SetFont
                | OpCode::PaintXObject
                | OpCode::SetGState
                | OpCode::ShadingFill
                | OpCode::SetFillColorSpace
                | OpCode::SetStrokeColorSpace
                | OpCode::SetFillColorN
                | OpCode::SetStrokeColorN
                | OpCode::BeginMarkedContentProps
                | OpCode::MarkPointProps
        )
    }
}

/// Operands of one group as read; few operators take more than six.
pub type RawOperands = SmallVec<[PDFObject; 6]>;

/// Fits `args` to the operator's arity: surplus operands are dropped from
/// the front, missing ones are padded with null at the end.
///
/// Returns the operand count the operator expects when it did not match.
pub fn normalize_operands(op: OpCode, args: &mut RawOperands) -> Option<usize> {
    match op.arity() {
        Arity::Fixed(expected) => {
            if args.len() == expected {
                return None;
            }
            if args.len() > expected {
                args.drain(..args.len() - expected);
            } else {
                args.resize(expected, PDFObject::Null);
            }
            Some(expected)
        }
        Arity::Variable(max) => {
            if args.len() <= max {
                return None;
            }
            args.drain(..args.len() - max);
            Some(max)
        }
    }
}

/// A fully resolved operand value.
///
/// Unlike [`PDFObject`] there are no references: named resources become
/// [`Operand::Resource`] ids into the owning [`OperatorList`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Null,
    Bool(bool),
    Number(f64),
    String(Bytes),
    Name(String),
    Array(Vec<Operand>),
    Dict(IndexMap<String, Operand>),
    Resource(String),
}

impl Operand {
    /// Converts a parsed object. References cannot appear in content
    /// streams and become null; a stream keeps only its dictionary.
    pub fn from_object(obj: &PDFObject) -> Operand {
        match obj {
            PDFObject::Boolean(b) => Operand::Bool(*b),
            PDFObject::Number(n) => Operand::Number(*n),
            PDFObject::String(s) | PDFObject::HexString(s) => Operand::String(Bytes::copy_from_slice(s)),
            PDFObject::Name(name) => Operand::Name(name.clone()),
            PDFObject::Array(items) => Operand::Array(items.iter().map(Operand::from_object).collect()),
            PDFObject::Dictionary(dict) => Operand::Dict(Self::dict_from(dict)),
            PDFObject::Stream(stream) => Operand::Dict(Self::dict_from(&stream.dict)),
            PDFObject::Null | PDFObject::Ref(_) | PDFObject::EOF | PDFObject::Command(_) => Operand::Null,
        }
    }

    pub fn dict_from(dict: &super::primitives::Dict) -> IndexMap<String, Operand> {
        dict.iter()
            .map(|(key, value)| (key.clone(), Operand::from_object(value)))
            .collect()
    }

    pub fn numbers(values: &[f64]) -> Operand {
        Operand::Array(values.iter().map(|&v| Operand::Number(v)).collect())
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Operand::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            Operand::Name(name) => Some(name),
            _ => None,
        }
    }

    /// Resource id, if this operand names one.
    pub fn as_resource(&self) -> Option<&str> {
        match self {
            Operand::Resource(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Operand::Null)
    }
}

/// A compiled content stream operation.
///
/// Consists of an operator code and its operand arguments.
/// This follows the PDF.js operation structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// The operator code
    pub op: OpCode,
    /// The operand arguments (read before the operator)
    pub args: Vec<Operand>,
}

impl Operation {
    /// Creates a new operation.
    pub fn new(op: OpCode, args: Vec<Operand>) -> Self {
        Operation { op, args }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.op)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", arg)?;
        }
        write!(f, ")")
    }
}

/// The compiled form of a page: operations in content order plus every
/// resource they reference.
///
/// Built by the interpreter and immutable afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorList {
    operations: Vec<Operation>,
    resources: IndexMap<String, Arc<Resource>>,
    /// Resource ids in first-use order
    dependencies: Vec<String>,
    incomplete: bool,
    warnings: Vec<Warning>,
}

impl OperatorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    /// Registers a resource and returns its id. Registering the same id
    /// twice keeps the first entry.
    pub fn add_resource(&mut self, resource: Arc<Resource>) -> String {
        let id = resource.id.clone();
        if !self.resources.contains_key(&id) {
            self.dependencies.push(id.clone());
            self.resources.insert(id.clone(), resource);
        }
        id
    }

    pub fn add_warning(&mut self, kind: WarningKind, message: impl Into<String>) {
        self.warnings.push(Warning {
            kind,
            message: message.into(),
        });
    }

    pub fn mark_incomplete(&mut self) {
        self.incomplete = true;
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Operator codes in order.
    pub fn ops(&self) -> impl Iterator<Item = OpCode> + '_ {
        self.operations.iter().map(|operation| operation.op)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn resource(&self, id: &str) -> Option<&Arc<Resource>> {
        self.resources.get(id)
    }

    pub fn resources(&self) -> impl Iterator<Item = &Arc<Resource>> {
        self.resources.values()
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// True when a content stream ended early and the list is partial.
    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }
}

/// One `operands... operator` group as read from the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOperation {
    pub command: String,
    pub args: RawOperands,
}

/// Splits decoded content bytes into operator groups.
///
/// Errors are positioned: after a [`PDFError::MalformedObject`] the
/// tokenizer has moved past the offending token and reading may go on.
/// Any other error, or operands left without an operator at the end, means
/// the stream is truncated.
pub struct ContentTokenizer {
    parser: Parser,
    args: RawOperands,
}

impl ContentTokenizer {
    pub fn new(content: Bytes) -> PDFResult<Self> {
        let lexer = Lexer::new(Box::new(Stream::from_bytes(content)))?;
        Ok(ContentTokenizer {
            parser: Parser::new(lexer)?,
            args: RawOperands::new(),
        })
    }

    /// Byte offset of the lexer, used to detect lack of progress.
    pub fn position(&self) -> usize {
        self.parser.lexer().position()
    }

    /// Reads the next group; `Ok(None)` at a clean end of stream.
    pub fn next_operation(&mut self) -> PDFResult<Option<RawOperation>> {
        loop {
            match self.parser.get_object()? {
                PDFObject::EOF => {
                    if self.args.is_empty() {
                        return Ok(None);
                    }
                    let dangling = std::mem::take(&mut self.args);
                    return Err(PDFError::TruncatedStream(format!(
                        "content ends with {} operand(s) but no operator",
                        dangling.len()
                    )));
                }
                PDFObject::Command(command) => {
                    return Ok(Some(RawOperation {
                        command,
                        args: std::mem::take(&mut self.args),
                    }));
                }
                operand => self.args.push(operand),
            }
        }
    }

    /// Drops operands collected before a malformed token.
    pub fn discard_operands(&mut self) {
        self.args.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn tokenizer(content: &str) -> ContentTokenizer {
        ContentTokenizer::new(Bytes::copy_from_slice(content.as_bytes())).unwrap()
    }

    #[test]
    fn test_opcode_from_command() {
        assert_eq!(OpCode::from_command("m"), Some(OpCode::MoveTo));
        assert_eq!(OpCode::from_command("l"), Some(OpCode::LineTo));
        assert_eq!(OpCode::from_command("cm"), Some(OpCode::Transform));
        assert_eq!(OpCode::from_command("Tj"), Some(OpCode::ShowText));
        assert_eq!(OpCode::from_command("F"), Some(OpCode::Fill));
        assert_eq!(OpCode::from_command("foo"), None);
        assert_eq!(OpCode::from_command("paintFormXObjectBegin"), None);
    }

    #[test]
    fn test_opcode_to_command() {
        assert_eq!(OpCode::MoveTo.to_command(), "m");
        assert_eq!(OpCode::Transform.to_command(), "cm");
        assert_eq!(OpCode::ShowText.to_command(), "Tj");
        assert_eq!(OpCode::PaintFormXObjectBegin as u8, 74);
        assert_eq!(OpCode::PaintImageMaskXObject as u8, 78);
    }

    #[test]
    fn test_arity_table() {
        assert_eq!(OpCode::Transform.arity(), Arity::Fixed(6));
        assert_eq!(OpCode::SetFont.arity(), Arity::Fixed(2));
        assert_eq!(OpCode::Save.arity(), Arity::Fixed(0));
        assert_eq!(OpCode::SetFillColorN.arity(), Arity::Variable(33));
    }

    #[test]
    fn test_normalize_keeps_trailing_operands() {
        let mut args: RawOperands = smallvec![
            PDFObject::Number(1.0),
            PDFObject::Number(2.0),
            PDFObject::Number(3.0),
        ];
        assert_eq!(normalize_operands(OpCode::MoveTo, &mut args), Some(2));
        assert_eq!(args.as_slice(), &[PDFObject::Number(2.0), PDFObject::Number(3.0)]);
        assert!(!args.spilled());
    }

    #[test]
    fn test_normalize_pads_missing_operands() {
        let mut args: RawOperands = smallvec![PDFObject::Name("F1".into())];
        assert_eq!(normalize_operands(OpCode::SetFont, &mut args), Some(2));
        assert_eq!(args.as_slice(), &[PDFObject::Name("F1".into()), PDFObject::Null]);

        let mut args: RawOperands = smallvec![PDFObject::Number(0.5)];
        assert_eq!(normalize_operands(OpCode::SetFillColor, &mut args), None);
    }

    #[test]
    fn test_read_simple_path() {
        let mut tokens = tokenizer("10 20 m\n30 40 l\nS");

        let op1 = tokens.next_operation().unwrap().unwrap();
        assert_eq!(op1.command, "m");
        assert_eq!(op1.args.len(), 2);

        let op2 = tokens.next_operation().unwrap().unwrap();
        assert_eq!(op2.command, "l");

        let op3 = tokens.next_operation().unwrap().unwrap();
        assert_eq!(op3.command, "S");
        assert!(op3.args.is_empty());

        assert!(tokens.next_operation().unwrap().is_none());
    }

    #[test]
    fn test_dangling_operands_are_truncation() {
        let mut tokens = tokenizer("q 1 0 0 1 0 0");
        assert!(tokens.next_operation().unwrap().is_some());
        assert!(matches!(
            tokens.next_operation(),
            Err(PDFError::TruncatedStream(_))
        ));
    }

    #[test]
    fn test_unterminated_string_is_truncation() {
        let mut tokens = tokenizer("BT (Hello Tj ET");
        let first = tokens.next_operation().unwrap().unwrap();
        assert_eq!(first.command, "BT");
        assert!(matches!(
            tokens.next_operation(),
            Err(PDFError::TruncatedStream(_))
        ));
    }

    #[test]
    fn test_operand_conversion() {
        let mut dict = super::super::primitives::Dict::new();
        dict.insert("MCID".to_string(), PDFObject::Number(3.0));
        let obj = PDFObject::Array(vec![
            PDFObject::HexString(vec![0x41]),
            PDFObject::Dictionary(dict),
            PDFObject::Ref(super::super::primitives::Ref::new(1, 0)),
        ]);
        let Operand::Array(items) = Operand::from_object(&obj) else {
            panic!("expected array");
        };
        assert_eq!(items[0], Operand::String(Bytes::from_static(b"A")));
        assert!(matches!(&items[1], Operand::Dict(d) if d["MCID"] == Operand::Number(3.0)));
        assert!(items[2].is_null());
    }

    #[test]
    fn test_operation_serializes() {
        let operation = Operation::new(OpCode::MoveTo, vec![Operand::Number(1.0), Operand::Number(2.0)]);
        let json = serde_json::to_string(&operation).unwrap();
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, operation);
        assert_eq!(operation.to_string(), "m (Number(1.0), Number(2.0))");
    }
}
