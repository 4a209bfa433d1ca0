//! Typed test values and their 64-bit wire encoding.
//!
//! Every value crossing the worker boundary is a sequence of `u64` words: one
//! word for integers, floats and references, two words (low half first) for a
//! `v128`. Floats travel as their raw bit patterns, so no value is ever
//! rounded on the way through.
//!
//! References use a fixed bias: null is the word `0` and a host handle `n` is
//! the word `n + REF_BIAS`, which keeps handle `0` distinguishable from null.
//! The bias is applied both to arguments and to expectations; the worker
//! echoes handle words back unchanged.
//!
//! Values that cannot be carried as arguments (NaN patterns, vectors with NaN
//! lanes, references without a handle) are reported as [`CodecError`]s. As
//! expectations the same shapes become wildcards, see [`Expected`].

use byteorder::{ByteOrder, LittleEndian};
use fhex::ToHex;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Offset added to a host reference handle to form its wire word.
pub const REF_BIAS: u64 = 1;

/// Reasons a value cannot be encoded or decoded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("nan pattern cannot be passed as an argument")]
    NanArgument,
    #[error("v128 argument with a nan lane cannot be passed")]
    VectorNanArgument,
    #[error("reference argument has no handle")]
    UnboundReference,
    #[error("reference handle {0} does not fit the wire encoding")]
    HandleOverflow(u64),
    #[error("{lane_type} expects {expected} lanes, got {found}")]
    LaneCount {
        lane_type: LaneType,
        expected: usize,
        found: usize,
    },
    #[error("unknown value type: {0}")]
    UnknownType(String),
    #[error("bad {ty} literal: {value}")]
    BadLiteral { ty: String, value: String },
    #[error("expected {expected} result words, got {found}")]
    WordCount { expected: usize, found: usize },
}

/// Width of a floating-point value, used by NaN wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatWidth {
    F32,
    F64,
}

impl FloatWidth {
    /// Whether `word` is a NaN bit pattern of this width: all-ones exponent
    /// and a nonzero mantissa. Any sign is accepted.
    pub fn is_nan(self, word: u64) -> bool {
        match self {
            FloatWidth::F32 => {
                if word >> 32 != 0 {
                    return false;
                }
                let bits = word as u32;
                (bits & 0x7F80_0000) == 0x7F80_0000 && (bits & 0x007F_FFFF) != 0
            }
            FloatWidth::F64 => {
                (word & 0x7FF0_0000_0000_0000) == 0x7FF0_0000_0000_0000 && (word & 0x000F_FFFF_FFFF_FFFF) != 0
            }
        }
    }
}

impl fmt::Display for FloatWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FloatWidth::F32 => write!(f, "f32"),
            FloatWidth::F64 => write!(f, "f64"),
        }
    }
}

/// Lane interpretation of a `v128` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneType {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl LaneType {
    /// Parse a lane type, accepting both `"i32"` and `"i32x4"` spellings.
    pub fn parse(s: &str) -> Option<LaneType> {
        match s {
            "i8" | "i8x16" => Some(LaneType::I8),
            "i16" | "i16x8" => Some(LaneType::I16),
            "i32" | "i32x4" => Some(LaneType::I32),
            "i64" | "i64x2" => Some(LaneType::I64),
            "f32" | "f32x4" => Some(LaneType::F32),
            "f64" | "f64x2" => Some(LaneType::F64),
            _ => None,
        }
    }

    pub fn lane_count(self) -> usize {
        16 / self.lane_bytes()
    }

    pub fn lane_bytes(self) -> usize {
        match self {
            LaneType::I8 => 1,
            LaneType::I16 => 2,
            LaneType::I32 | LaneType::F32 => 4,
            LaneType::I64 | LaneType::F64 => 8,
        }
    }

    /// Bit mask for truncating a lane value to the lane's width.
    pub fn lane_mask(self) -> u64 {
        match self.lane_bytes() {
            8 => u64::MAX,
            n => (1u64 << (n * 8)) - 1,
        }
    }

    pub fn float_width(self) -> Option<FloatWidth> {
        match self {
            LaneType::F32 => Some(FloatWidth::F32),
            LaneType::F64 => Some(FloatWidth::F64),
            _ => None,
        }
    }
}

impl fmt::Display for LaneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LaneType::I8 => "i8x16",
            LaneType::I16 => "i16x8",
            LaneType::I32 => "i32x4",
            LaneType::I64 => "i64x2",
            LaneType::F32 => "f32x4",
            LaneType::F64 => "f64x2",
        };
        f.write_str(name)
    }
}

/// Reference kinds that can appear in a command script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Func,
    Extern,
    Any,
    Exn,
    Eq,
    I31,
    Struct,
    Array,
    /// Bottom types: the only inhabitant is null.
    NullFunc,
    NullExtern,
    NullExn,
    None,
}

impl RefKind {
    /// Parse a reference type name as written by `wast2json` (`"externref"`).
    pub fn parse(s: &str) -> Option<RefKind> {
        match s {
            "funcref" => Some(RefKind::Func),
            "externref" => Some(RefKind::Extern),
            "anyref" => Some(RefKind::Any),
            "exnref" => Some(RefKind::Exn),
            "eqref" => Some(RefKind::Eq),
            "i31ref" => Some(RefKind::I31),
            "structref" => Some(RefKind::Struct),
            "arrayref" => Some(RefKind::Array),
            "nullfuncref" => Some(RefKind::NullFunc),
            "nullexternref" => Some(RefKind::NullExtern),
            "nullexnref" => Some(RefKind::NullExn),
            "nullref" => Some(RefKind::None),
            _ => None,
        }
    }

    pub fn is_bottom(self) -> bool {
        matches!(
            self,
            RefKind::NullFunc | RefKind::NullExtern | RefKind::NullExn | RefKind::None
        )
    }

    fn name(self) -> &'static str {
        match self {
            RefKind::Func => "funcref",
            RefKind::Extern => "externref",
            RefKind::Any => "anyref",
            RefKind::Exn => "exnref",
            RefKind::Eq => "eqref",
            RefKind::I31 => "i31ref",
            RefKind::Struct => "structref",
            RefKind::Array => "arrayref",
            RefKind::NullFunc => "nullfuncref",
            RefKind::NullExtern => "nullexternref",
            RefKind::NullExn => "nullexnref",
            RefKind::None => "nullref",
        }
    }
}

/// A floating-point literal that may be a NaN pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatLit<T> {
    Bits(T),
    NanCanonical,
    NanArithmetic,
}

impl<T: Copy> FloatLit<T> {
    fn bits(&self) -> Option<T> {
        match self {
            FloatLit::Bits(b) => Some(*b),
            _ => None,
        }
    }
}

/// A single lane of a `v128` literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Integer lane, stored as a wrapping bit pattern.
    Int(u64),
    F32(FloatLit<u32>),
    F64(FloatLit<u64>),
}

impl Lane {
    fn bits(&self) -> Option<u64> {
        match self {
            Lane::Int(v) => Some(*v),
            Lane::F32(f) => f.bits().map(u64::from),
            Lane::F64(f) => f.bits(),
        }
    }
}

/// Payload of a reference value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefHandle {
    Null,
    Handle(u64),
    /// No literal given: any non-null reference of the kind.
    Any,
}

/// Declared kind of a value, used to decode result words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    I32,
    I64,
    F32,
    F64,
    V128(LaneType),
    Ref(RefKind),
}

impl ValueKind {
    /// Number of wire words a value of this kind occupies.
    pub fn width(self) -> usize {
        match self {
            ValueKind::V128(_) => 2,
            _ => 1,
        }
    }
}

/// A typed constant used as an argument or an expected result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestValue {
    I32(u32),
    I64(u64),
    F32(FloatLit<u32>),
    F64(FloatLit<u64>),
    V128 { lane_type: LaneType, lanes: Vec<Lane> },
    Ref { kind: RefKind, handle: RefHandle },
}

impl TestValue {
    /// Build a `v128` value, checking the lane count against the lane type.
    pub fn v128(lane_type: LaneType, lanes: Vec<Lane>) -> Result<TestValue, CodecError> {
        check_lane_count(lane_type, lanes.len())?;
        Ok(TestValue::V128 { lane_type, lanes })
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            TestValue::I32(_) => ValueKind::I32,
            TestValue::I64(_) => ValueKind::I64,
            TestValue::F32(_) => ValueKind::F32,
            TestValue::F64(_) => ValueKind::F64,
            TestValue::V128 { lane_type, .. } => ValueKind::V128(*lane_type),
            TestValue::Ref { kind, .. } => ValueKind::Ref(*kind),
        }
    }
}

impl fmt::Display for TestValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestValue::I32(v) => write!(f, "i32:{v}"),
            TestValue::I64(v) => write!(f, "i64:{v}"),
            TestValue::F32(lit) => match lit {
                FloatLit::Bits(b) => write!(f, "f32:{}", f32::from_bits(*b).to_hex()),
                FloatLit::NanCanonical => write!(f, "f32:nan:canonical"),
                FloatLit::NanArithmetic => write!(f, "f32:nan:arithmetic"),
            },
            TestValue::F64(lit) => match lit {
                FloatLit::Bits(b) => write!(f, "f64:{}", f64::from_bits(*b).to_hex()),
                FloatLit::NanCanonical => write!(f, "f64:nan:canonical"),
                FloatLit::NanArithmetic => write!(f, "f64:nan:arithmetic"),
            },
            TestValue::V128 { lane_type, lanes } => {
                write!(f, "v128:{lane_type}[")?;
                for (i, lane) in lanes.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    match lane {
                        Lane::Int(v) => write!(f, "{v}")?,
                        Lane::F32(FloatLit::Bits(b)) => write!(f, "{}", f32::from_bits(*b).to_hex())?,
                        Lane::F64(FloatLit::Bits(b)) => write!(f, "{}", f64::from_bits(*b).to_hex())?,
                        _ => write!(f, "nan")?,
                    }
                }
                write!(f, "]")
            }
            TestValue::Ref { kind, handle } => match handle {
                RefHandle::Null => write!(f, "{}:null", kind.name()),
                RefHandle::Handle(h) => write!(f, "{}:{h}", kind.name()),
                RefHandle::Any => write!(f, "{}:any", kind.name()),
            },
        }
    }
}

/// An encoded call argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireArg {
    Word(u64),
    /// A `v128` as (low, high) words.
    Vector(u64, u64),
}

impl WireArg {
    pub fn is_vector(&self) -> bool {
        matches!(self, WireArg::Vector(..))
    }
}

impl fmt::Display for WireArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireArg::Word(w) => write!(f, "{w}"),
            WireArg::Vector(lo, hi) => write!(f, "v128:{lo}:{hi}"),
        }
    }
}

impl FromStr for WireArg {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || CodecError::BadLiteral {
            ty: "wire argument".to_string(),
            value: s.to_string(),
        };
        match s.strip_prefix("v128:") {
            Some(rest) => {
                let (lo, hi) = rest.split_once(':').ok_or_else(bad)?;
                Ok(WireArg::Vector(
                    lo.parse().map_err(|_| bad())?,
                    hi.parse().map_err(|_| bad())?,
                ))
            }
            None => s.parse().map(WireArg::Word).map_err(|_| bad()),
        }
    }
}

/// Expected form of a lane inside a vector wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneExpect {
    Bits(u64),
    Nan,
}

/// What a single result is expected to look like on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expected {
    /// One word, compared bit-exactly.
    Scalar(u64),
    /// Two words (low, high), compared bit-exactly.
    Vector(u64, u64),
    /// Any NaN of the given width.
    NanWildcard(FloatWidth),
    /// A vector where NaN lanes accept any NaN and the others are exact.
    VectorNanWildcard { lane_type: LaneType, lanes: Vec<LaneExpect> },
    /// Any non-null reference.
    RefWildcard,
    /// Any one of several alternatives.
    Either(Vec<Expected>),
}

impl Expected {
    /// Whether this descriptor occupies two wire words.
    pub fn is_vector(&self) -> bool {
        matches!(self, Expected::Vector(..) | Expected::VectorNanWildcard { .. })
    }
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expected::Scalar(w) => write!(f, "{w}"),
            Expected::Vector(lo, hi) => write!(f, "v128:{lo}:{hi}"),
            Expected::NanWildcard(width) => write!(f, "nan:{width}"),
            Expected::VectorNanWildcard { lane_type, lanes } => {
                write!(f, "v128:{lane_type}[")?;
                for (i, lane) in lanes.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    match lane {
                        LaneExpect::Bits(b) => write!(f, "{b}")?,
                        LaneExpect::Nan => write!(f, "nan")?,
                    }
                }
                write!(f, "]")
            }
            Expected::RefWildcard => write!(f, "ref:any"),
            Expected::Either(alternatives) => {
                write!(f, "either(")?;
                for (i, alt) in alternatives.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{alt}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Encode a value for use as a call argument.
pub fn encode_arg(value: &TestValue) -> Result<WireArg, CodecError> {
    match value {
        TestValue::I32(v) => Ok(WireArg::Word(u64::from(*v))),
        TestValue::I64(v) => Ok(WireArg::Word(*v)),
        TestValue::F32(lit) => lit.bits().map(|b| WireArg::Word(u64::from(b))).ok_or(CodecError::NanArgument),
        TestValue::F64(lit) => lit.bits().map(WireArg::Word).ok_or(CodecError::NanArgument),
        TestValue::V128 { lane_type, lanes } => {
            check_lane_count(*lane_type, lanes.len())?;
            let bits = lanes
                .iter()
                .map(Lane::bits)
                .collect::<Option<Vec<u64>>>()
                .ok_or(CodecError::VectorNanArgument)?;
            let (lo, hi) = pack_lanes(*lane_type, &bits)?;
            Ok(WireArg::Vector(lo, hi))
        }
        TestValue::Ref { handle, .. } => match handle {
            RefHandle::Null => Ok(WireArg::Word(0)),
            RefHandle::Handle(h) => bias(*h).map(WireArg::Word),
            RefHandle::Any => Err(CodecError::UnboundReference),
        },
    }
}

/// Encode a value as an expected result, turning NaN patterns and unbound
/// references into wildcards.
pub fn expect(value: &TestValue) -> Result<Expected, CodecError> {
    match value {
        TestValue::I32(v) => Ok(Expected::Scalar(u64::from(*v))),
        TestValue::I64(v) => Ok(Expected::Scalar(*v)),
        TestValue::F32(lit) => Ok(lit
            .bits()
            .map(|b| Expected::Scalar(u64::from(b)))
            .unwrap_or(Expected::NanWildcard(FloatWidth::F32))),
        TestValue::F64(lit) => Ok(lit
            .bits()
            .map(Expected::Scalar)
            .unwrap_or(Expected::NanWildcard(FloatWidth::F64))),
        TestValue::V128 { lane_type, lanes } => {
            check_lane_count(*lane_type, lanes.len())?;
            match lanes.iter().map(Lane::bits).collect::<Option<Vec<u64>>>() {
                Some(bits) => {
                    let (lo, hi) = pack_lanes(*lane_type, &bits)?;
                    Ok(Expected::Vector(lo, hi))
                }
                None => Ok(Expected::VectorNanWildcard {
                    lane_type: *lane_type,
                    lanes: lanes
                        .iter()
                        .map(|l| match l.bits() {
                            Some(b) => LaneExpect::Bits(b & lane_type.lane_mask()),
                            None => LaneExpect::Nan,
                        })
                        .collect(),
                }),
            }
        }
        TestValue::Ref { kind, handle } => match handle {
            RefHandle::Null => Ok(Expected::Scalar(0)),
            RefHandle::Handle(h) => bias(*h).map(Expected::Scalar),
            RefHandle::Any if kind.is_bottom() => Ok(Expected::Scalar(0)),
            RefHandle::Any => Ok(Expected::RefWildcard),
        },
    }
}

/// Decode result words back into a value of the given kind.
pub fn decode(words: &[u64], kind: ValueKind) -> Result<TestValue, CodecError> {
    if words.len() != kind.width() {
        return Err(CodecError::WordCount {
            expected: kind.width(),
            found: words.len(),
        });
    }
    let word = words[0];
    Ok(match kind {
        ValueKind::I32 => TestValue::I32(word as u32),
        ValueKind::I64 => TestValue::I64(word),
        ValueKind::F32 => TestValue::F32(FloatLit::Bits(word as u32)),
        ValueKind::F64 => TestValue::F64(FloatLit::Bits(word)),
        ValueKind::V128(lane_type) => {
            let lanes = unpack_lanes(lane_type, words[0], words[1])
                .into_iter()
                .map(|bits| match lane_type {
                    LaneType::F32 => Lane::F32(FloatLit::Bits(bits as u32)),
                    LaneType::F64 => Lane::F64(FloatLit::Bits(bits)),
                    _ => Lane::Int(bits),
                })
                .collect();
            TestValue::V128 { lane_type, lanes }
        }
        ValueKind::Ref(kind) => TestValue::Ref {
            kind,
            handle: match word {
                0 => RefHandle::Null,
                w => RefHandle::Handle(w - REF_BIAS),
            },
        },
    })
}

/// Pack raw lane bit patterns into (low, high) words, little-endian.
pub fn pack_lanes(lane_type: LaneType, lanes: &[u64]) -> Result<(u64, u64), CodecError> {
    check_lane_count(lane_type, lanes.len())?;
    let width = lane_type.lane_bytes();
    let mut buf = [0u8; 16];
    for (i, bits) in lanes.iter().enumerate() {
        LittleEndian::write_uint(&mut buf[i * width..(i + 1) * width], bits & lane_type.lane_mask(), width);
    }
    Ok((LittleEndian::read_u64(&buf[..8]), LittleEndian::read_u64(&buf[8..])))
}

/// Split (low, high) words into lane bit patterns.
pub fn unpack_lanes(lane_type: LaneType, lo: u64, hi: u64) -> Vec<u64> {
    let width = lane_type.lane_bytes();
    let mut buf = [0u8; 16];
    LittleEndian::write_u64(&mut buf[..8], lo);
    LittleEndian::write_u64(&mut buf[8..], hi);
    buf.chunks_exact(width)
        .map(|chunk| LittleEndian::read_uint(chunk, width))
        .collect()
}

fn check_lane_count(lane_type: LaneType, found: usize) -> Result<(), CodecError> {
    if found != lane_type.lane_count() {
        return Err(CodecError::LaneCount {
            lane_type,
            expected: lane_type.lane_count(),
            found,
        });
    }
    Ok(())
}

fn bias(handle: u64) -> Result<u64, CodecError> {
    handle.checked_add(REF_BIAS).ok_or(CodecError::HandleOverflow(handle))
}
