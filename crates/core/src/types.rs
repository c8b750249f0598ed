//! Identifier and tag types
//!
//! Every numeric value that reaches the on-disk log goes through one of the
//! `*_tag` functions in this module, so the log format never depends on the
//! discriminant layout of a Rust enum.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Variable identifier within a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarId(pub u32);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "var#{}", self.0)
    }
}

/// Dimension identifier within a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DimId(pub u32);

/// Element kinds a variable (or a write buffer) can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    /// 8-bit character data
    Text,
    /// Signed 8-bit integer
    Byte,
    /// Unsigned 8-bit integer
    UByte,
    /// Signed 16-bit integer
    Short,
    /// Unsigned 16-bit integer
    UShort,
    /// Signed 32-bit integer
    Int,
    /// Unsigned 32-bit integer
    UInt,
    /// 32-bit IEEE float
    Float,
    /// 64-bit IEEE float
    Double,
    /// Signed 64-bit integer
    Int64,
    /// Unsigned 64-bit integer
    UInt64,
}

impl ElementType {
    /// Every supported element type, in tag order.
    pub const ALL: [ElementType; 11] = [
        ElementType::Text,
        ElementType::Byte,
        ElementType::UByte,
        ElementType::Short,
        ElementType::UShort,
        ElementType::Int,
        ElementType::UInt,
        ElementType::Float,
        ElementType::Double,
        ElementType::Int64,
        ElementType::UInt64,
    ];

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            ElementType::Text | ElementType::Byte | ElementType::UByte => 1,
            ElementType::Short | ElementType::UShort => 2,
            ElementType::Int | ElementType::UInt | ElementType::Float => 4,
            ElementType::Double | ElementType::Int64 | ElementType::UInt64 => 8,
        }
    }

    /// Tag stored in metadata log entries.
    ///
    /// Tags start at 1 so that a zeroed entry never decodes to a valid type.
    pub fn log_tag(self) -> u32 {
        match self {
            ElementType::Text => 1,
            ElementType::Byte => 2,
            ElementType::UByte => 3,
            ElementType::Short => 4,
            ElementType::UShort => 5,
            ElementType::Int => 6,
            ElementType::UInt => 7,
            ElementType::Float => 8,
            ElementType::Double => 9,
            ElementType::Int64 => 10,
            ElementType::UInt64 => 11,
        }
    }

    /// Inverse of [`ElementType::log_tag`].
    pub fn from_log_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(ElementType::Text),
            2 => Some(ElementType::Byte),
            3 => Some(ElementType::UByte),
            4 => Some(ElementType::Short),
            5 => Some(ElementType::UShort),
            6 => Some(ElementType::Int),
            7 => Some(ElementType::UInt),
            8 => Some(ElementType::Float),
            9 => Some(ElementType::Double),
            10 => Some(ElementType::Int64),
            11 => Some(ElementType::UInt64),
            _ => None,
        }
    }

    /// Lowercase name, as used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            ElementType::Text => "text",
            ElementType::Byte => "byte",
            ElementType::UByte => "ubyte",
            ElementType::Short => "short",
            ElementType::UShort => "ushort",
            ElementType::Int => "int",
            ElementType::UInt => "uint",
            ElementType::Float => "float",
            ElementType::Double => "double",
            ElementType::Int64 => "int64",
            ElementType::UInt64 => "uint64",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a logged write addresses its variable.
///
/// The log writer only ever emits `Range` and `Strided`; single-element and
/// whole-variable writes are normalised into ranges before they reach it.
/// The other kinds are still decoded so that a log produced by another
/// writer can be inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteKind {
    /// Whole variable
    Whole,
    /// One element
    Element,
    /// Contiguous start/count range
    Range,
    /// Start/count/stride range
    Strided,
}

impl WriteKind {
    /// Tag stored in metadata log entries.
    pub fn log_tag(self) -> u32 {
        match self {
            WriteKind::Whole => 1,
            WriteKind::Element => 2,
            WriteKind::Range => 3,
            WriteKind::Strided => 4,
        }
    }

    /// Inverse of [`WriteKind::log_tag`].
    pub fn from_log_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(WriteKind::Whole),
            2 => Some(WriteKind::Element),
            3 => Some(WriteKind::Range),
            4 => Some(WriteKind::Strided),
            _ => None,
        }
    }

    /// Whether entries of this kind carry meaningful strides.
    pub fn has_stride(self) -> bool {
        matches!(self, WriteKind::Strided)
    }
}

/// Data mode of the dataset.
///
/// Collective operations must be entered by every process of the dataset in
/// the same order; independent operations need not be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IoMode {
    /// All processes participate
    #[default]
    Collective,
    /// Each process acts alone
    Independent,
}

/// Handle for an outstanding non-blocking operation.
///
/// Log-owned ids and driver-owned ids live in separate namespaces, so a mixed
/// list passed to `wait` or `cancel` can be split without ambiguity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RequestId {
    /// Deferred write tracked by the log
    Log(u32),
    /// Request owned by the base driver
    Driver(u64),
}

impl RequestId {
    /// Whether this id belongs to the log.
    pub fn is_log(&self) -> bool {
        matches!(self, RequestId::Log(_))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Log(id) => write!(f, "log-request {}", id),
            RequestId::Driver(id) => write!(f, "driver-request {}", id),
        }
    }
}

/// Which outstanding requests a `wait_all` / `cancel_all` applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitScope {
    /// Every outstanding request
    All,
    /// Only deferred writes
    Puts,
    /// Only deferred reads
    Gets,
}
