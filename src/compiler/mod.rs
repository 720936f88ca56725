//! Instruction-to-search-pattern compiler

use std::fmt;

use crate::{Address, DecodeError};

pub mod walk;
pub mod wildcard;
#[cfg(test)]
pub(crate) mod testing;

pub use self::walk::{compile, MAX_STEPS, BOUNDARY_SLACK};
pub use self::wildcard::instruction_tokens;

/// Marker emitted once per wildcarded byte
pub const WILDCARD: &str = "??";

/// One element of a compiled pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternToken {
    /// A byte that must match exactly
    Byte(u8),
    /// A run of bytes that match anything
    Wildcard(usize),
}

impl PatternToken {
    /// Number of bytes the token covers
    pub fn len(&self) -> usize {
        match self {
            PatternToken::Byte(_) => 1,
            PatternToken::Wildcard(n) => *n,
        }
    }

    /// Returns true for a zero-length wildcard run
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for PatternToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternToken::Byte(b) => write!(f, "{:02x}", b),
            PatternToken::Wildcard(n) => {
                for i in 0..*n {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    f.write_str(WILDCARD)?;
                }
                Ok(())
            }
        }
    }
}

/// Render a token sequence as space separated text.
pub fn render_tokens(tokens: &[PatternToken]) -> String {
    tokens
        .iter()
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Outcome of compiling the unit at one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitEntry {
    /// Address of the unit
    pub address: Address,
    /// Tokens, or the reason the unit contributed nothing
    pub result: Result<Vec<PatternToken>, DecodeError>,
}

impl UnitEntry {
    /// Pattern text for this unit; empty if decoding failed.
    pub fn fragment(&self) -> String {
        match &self.result {
            Ok(tokens) => render_tokens(tokens),
            Err(_) => String::new(),
        }
    }
}

/// The compiled pattern for a selection, plus its transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledPattern {
    units: Vec<UnitEntry>,
    transcript: String,
    truncated: bool,
}

impl CompiledPattern {
    pub(crate) fn new(units: Vec<UnitEntry>, transcript: String, truncated: bool) -> Self {
        Self {
            units,
            transcript,
            truncated,
        }
    }

    /// Every unit visited by the walk, in address order
    pub fn units(&self) -> &[UnitEntry] {
        &self.units
    }

    /// Number of units visited, failed ones included
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Units that failed to decode
    pub fn failures(&self) -> impl Iterator<Item = (Address, &DecodeError)> {
        self.units
            .iter()
            .filter_map(|u| u.result.as_ref().err().map(|e| (u.address, e)))
    }

    /// Per-unit pattern fragments, failed units included as empty strings
    pub fn fragments(&self) -> Vec<String> {
        self.units.iter().map(UnitEntry::fragment).collect()
    }

    /// The search pattern: fragments joined by single spaces
    pub fn pattern(&self) -> String {
        self.joined(" ")
    }

    /// One fragment per line, for the preview editor
    pub fn preview_text(&self) -> String {
        self.joined("\n")
    }

    /// `"<hex bytes>\t<disassembly>\n"` for every instruction visited
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// Returns true if the walk hit [`MAX_STEPS`] before reaching the end
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Number of bytes the pattern matches
    pub fn byte_len(&self) -> usize {
        self.units
            .iter()
            .filter_map(|u| u.result.as_ref().ok())
            .flat_map(|tokens| tokens.iter())
            .map(PatternToken::len)
            .sum()
    }

    fn joined(&self, sep: &str) -> String {
        self.fragments()
            .into_iter()
            .filter(|f| !f.is_empty())
            .collect::<Vec<_>>()
            .join(sep)
    }
}

/// Clean up a pattern the user edited in the preview: line breaks go away and
/// runs of whitespace collapse to one space.
pub fn normalize_pattern(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
