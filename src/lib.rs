//! Core IR, traits and errors for the UnpacMe byte-pattern search plugin.
//!
//! The crate turns a selected address range of a disassembled program into a
//! byte pattern, wildcarding the bytes of position-dependent operands, and
//! looks the pattern up on the UnpacMe threat-intelligence service.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use std::fs;
//! use unpacme_search::{
//!     compiler,
//!     decoder::X86Source,
//!     logging::Logger,
//!     parser::GoblinParser,
//!     AddressRange,
//! };
//!
//! let data = fs::read("path/to/binary").unwrap();
//! let image = GoblinParser::new().parse(&data).unwrap();
//! let source = X86Source::new(&image);
//! let log = Logger::new("UnpacMeSearch");
//!
//! let range = AddressRange::new(0x401000, 0x401020).unwrap();
//! let compiled = compiler::compile(range, &source, true, &log).unwrap();
//!
//! println!("{}", compiled.pattern());
//! print!("{}", compiled.transcript());
//! ```

pub mod logging;
pub mod parser;
pub mod decoder;
pub mod compiler;
pub mod search;
pub mod classify;
pub mod format;
pub mod config;
pub mod credentials;
pub mod plugin;
mod scenario_tests;

use std::fmt;

/// Represents an address in the host's program view
pub type Address = u64;

/// Sentinel returned by instruction sources for "no address".
pub const BAD_ADDRESS: Address = 0xffff_ffff_ffff_ffff;

/// Every value hosts use to mean "address unavailable".
pub const BAD_ADDRESSES: [Address; 2] = [0xffff_ffff, BAD_ADDRESS];

/// Returns true if `addr` is one of the sentinel addresses.
pub fn is_bad_address(addr: Address) -> bool {
    BAD_ADDRESSES.contains(&addr)
}

/// A selected, half-open range of addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    /// First address of the selection
    pub start: Address,
    /// Address just past the selection
    pub end: Address,
}

impl AddressRange {
    /// Validate a raw selection.
    ///
    /// Fails if either bound is a sentinel or `start > end`.
    pub fn new(start: Address, end: Address) -> Result<Self, RangeError> {
        if is_bad_address(start) || is_bad_address(end) {
            return Err(RangeError::NothingSelected);
        }
        if start > end {
            return Err(RangeError::StartAfterEnd { start, end });
        }
        Ok(Self { start, end })
    }

    /// Number of bytes covered by the range
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Returns true if the range covers no bytes
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}-0x{:x}", self.start, self.end)
    }
}

/// Why a selection could not be compiled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    /// A bound was missing or a sentinel
    #[error("Nothing Selected!")]
    NothingSelected,

    /// The selection runs backwards
    #[error("Start is greater than end (0x{start:x} > 0x{end:x})")]
    StartAfterEnd { start: Address, end: Address },
}

/// Operand classification reported by the instruction source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    /// General or special register
    Register,
    /// Immediate value
    Immediate,
    /// Direct memory reference (absolute or RIP-relative)
    Memory,
    /// Memory through base and/or index registers, no displacement
    Phrase,
    /// Memory through base and/or index registers plus a displacement
    Displacement,
    /// Far branch target (segment:offset)
    FarBranch,
    /// Near branch target
    NearBranch,
    /// Anything else the decoder reports
    Other,
}

impl OperandKind {
    /// Returns true if the operand's encoding depends on where the code is
    /// loaded or what it targets.
    pub fn is_position_dependent(self) -> bool {
        matches!(
            self,
            OperandKind::Memory
                | OperandKind::Phrase
                | OperandKind::Displacement
                | OperandKind::FarBranch
                | OperandKind::NearBranch
        )
    }
}

impl fmt::Display for OperandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperandKind::Register => write!(f, "reg"),
            OperandKind::Immediate => write!(f, "imm"),
            OperandKind::Memory => write!(f, "mem"),
            OperandKind::Phrase => write!(f, "phrase"),
            OperandKind::Displacement => write!(f, "displ"),
            OperandKind::FarBranch => write!(f, "far"),
            OperandKind::NearBranch => write!(f, "near"),
            OperandKind::Other => write!(f, "other"),
        }
    }
}

/// One decoded operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    /// Operand classification
    pub kind: OperandKind,
    /// Byte offset inside the instruction where the operand's encoding starts
    pub encoding_offset: usize,
}

impl Operand {
    /// Create a new operand
    pub fn new(kind: OperandKind, encoding_offset: usize) -> Self {
        Self { kind, encoding_offset }
    }

    /// Shorthand for `self.kind.is_position_dependent()`
    pub fn is_position_dependent(&self) -> bool {
        self.kind.is_position_dependent()
    }
}

/// Maximum number of operands the pattern compiler looks at.
pub const MAX_OPERANDS: usize = 2;

/// Decoder view of one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInsn {
    /// Size of the instruction in bytes
    pub size: usize,
    /// Up to [`MAX_OPERANDS`] operands, in operand order
    pub operands: Vec<Operand>,
}

impl DecodedInsn {
    /// Operand `n` (zero based), if the decoder reported one
    pub fn operand(&self, n: usize) -> Option<&Operand> {
        self.operands.get(n).filter(|_| n < MAX_OPERANDS)
    }
}

/// What lives at one address of the program view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedUnit {
    /// Not code; the bytes go into the pattern verbatim
    Data {
        size: usize,
        bytes: Vec<u8>,
    },
    /// A decoded instruction
    Instruction {
        size: usize,
        bytes: Vec<u8>,
        operands: Vec<Operand>,
        text: String,
    },
}

impl DecodedUnit {
    /// Size of the unit in bytes
    pub fn size(&self) -> usize {
        match self {
            DecodedUnit::Data { size, .. } | DecodedUnit::Instruction { size, .. } => *size,
        }
    }

    /// Raw bytes of the unit
    pub fn bytes(&self) -> &[u8] {
        match self {
            DecodedUnit::Data { bytes, .. } | DecodedUnit::Instruction { bytes, .. } => bytes,
        }
    }
}

/// Failure to decode or format a single unit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The bytes at the address are not a valid instruction
    #[error("invalid instruction at 0x{0:x}")]
    InvalidInstruction(Address),

    /// The address is not backed by any loaded bytes
    #[error("0x{0:x} is not mapped")]
    Unmapped(Address),

    /// Fewer bytes were available than the unit needs
    #[error("short read at 0x{addr:x}: wanted {expected} bytes, got {actual}")]
    ShortRead {
        addr: Address,
        expected: usize,
        actual: usize,
    },

    /// The decoder reported a zero-length unit
    #[error("zero-sized unit at 0x{0:x}")]
    ZeroSize(Address),

    /// The disassembly line could not be produced
    #[error("failed to format 0x{addr:x}: {reason}")]
    Format { addr: Address, reason: String },
}

/// The host's decoded view of the program.
///
/// Implementations answer questions about single addresses; the pattern
/// compiler drives the walk.
pub trait InstructionSource {
    /// Returns true if `addr` is the start of code rather than data
    fn is_code(&self, addr: Address) -> bool;

    /// Size in bytes of the item (instruction or data) at `addr`
    fn unit_size(&self, addr: Address) -> usize;

    /// Read `size` bytes starting at `addr`
    fn read_bytes(&self, addr: Address, size: usize) -> Result<Vec<u8>, DecodeError>;

    /// Decode the instruction at `addr`
    fn decode_instruction(&self, addr: Address) -> Result<DecodedInsn, DecodeError>;

    /// Human-readable disassembly line for `addr`
    fn disassembly_text(&self, addr: Address) -> Result<String, DecodeError>;

    /// Start of the next unit after `addr`, below `limit`.
    ///
    /// Returns [`BAD_ADDRESS`] when the source cannot tell.
    fn next_unit_boundary(&self, addr: Address, limit: Address) -> Address;
}

/// Crate-level error type
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// Bad selection
    #[error(transparent)]
    Range(#[from] RangeError),

    /// Binary could not be loaded
    #[error(transparent)]
    Parse(#[from] parser::ParseError),

    /// Remote search failed
    #[error(transparent)]
    Search(#[from] search::SearchError),

    /// Configuration could not be read or written
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    /// Credential store failure
    #[error(transparent)]
    Credential(#[from] credentials::CredentialError),

    /// Result rendering failed
    #[error("Failed to format results: {0}")]
    Format(String),

    /// The host refused a request from the plugin
    #[error("Host error: {0}")]
    Host(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
