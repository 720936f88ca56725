//! Range walk: visit every unit of a selection and collect its pattern.

use crate::logging::{log_debug, log_error, log_warn, Logger};
use crate::{
    is_bad_address, Address, AddressRange, DecodeError, DecodedUnit, InstructionSource, RangeError,
    MAX_OPERANDS,
};
use super::{instruction_tokens, CompiledPattern, PatternToken, UnitEntry};

/// Hard cap on the number of units one walk evaluates
pub const MAX_STEPS: usize = 100;

/// How far past the end of the range a unit boundary may be looked for
pub const BOUNDARY_SLACK: Address = 32;

/// Compile the units covering `range` into a search pattern.
///
/// The range is re-validated before anything is asked of `source`. A unit
/// that fails to decode is logged and contributes an empty entry; the walk
/// carries on past it. At most [`MAX_STEPS`] units are visited.
///
/// # Arguments
/// * `range` - Selection to compile
/// * `source` - The host's decoded view of the program
/// * `auto_wildcard` - Wildcard position-dependent operands
/// * `log` - Plugin logger
pub fn compile(
    range: AddressRange,
    source: &dyn InstructionSource,
    auto_wildcard: bool,
    log: &Logger,
) -> Result<CompiledPattern, RangeError> {
    let range = AddressRange::new(range.start, range.end)?;
    log_debug!(log, "Start: 0x{:x} End: 0x{:x}", range.start, range.end);

    let limit = range.end.saturating_add(BOUNDARY_SLACK);
    let mut units = Vec::new();
    let mut transcript = String::new();
    let mut truncated = false;
    let mut cursor = range.start;

    while cursor < range.end {
        if units.len() == MAX_STEPS {
            log_warn!(log, "Stopped after {} units at 0x{:x}", MAX_STEPS, cursor);
            truncated = true;
            break;
        }

        let result = read_unit(source, cursor).map(|unit| {
            log_debug!(log, "0x{:x}: {} bytes", cursor, unit.size());
            match unit {
                DecodedUnit::Data { bytes, .. } => {
                    log_debug!(log, "Processing as data");
                    bytes.into_iter().map(PatternToken::Byte).collect()
                }
                DecodedUnit::Instruction {
                    bytes, operands, text, ..
                } => {
                    log_debug!(log, "{}", text);
                    transcript.push_str(&format!("{}\t{}\n", hex_bytes(&bytes), text));
                    instruction_tokens(&bytes, &operands, auto_wildcard)
                }
            }
        });
        if let Err(e) = &result {
            log_error!(log, "Failed to process 0x{:x}: {}", cursor, e);
        }
        units.push(UnitEntry {
            address: cursor,
            result,
        });

        let next = source.next_unit_boundary(cursor, limit);
        log_debug!(log, "Next Offset: 0x{:x}", next);

        if !is_bad_address(next) && next >= range.end {
            break;
        }
        if is_bad_address(next) || next <= cursor {
            log_debug!(log, "Decoder gave no usable boundary after 0x{:x}, stepping one byte", cursor);
            cursor += 1;
        } else {
            cursor = next;
        }
    }

    let compiled = CompiledPattern::new(units, transcript, truncated);
    log_debug!(log, "Search Bytes: {}", compiled.pattern());
    Ok(compiled)
}

/// Ask the source for everything known about the unit at `addr`.
fn read_unit(source: &dyn InstructionSource, addr: Address) -> Result<DecodedUnit, DecodeError> {
    if !source.is_code(addr) {
        let size = source.unit_size(addr);
        let bytes = read_exact(source, addr, size)?;
        return Ok(DecodedUnit::Data { size, bytes });
    }

    let insn = source.decode_instruction(addr)?;
    let bytes = read_exact(source, addr, insn.size)?;
    let text = source.disassembly_text(addr)?;

    let mut operands = insn.operands;
    operands.truncate(MAX_OPERANDS);

    Ok(DecodedUnit::Instruction {
        size: insn.size,
        bytes,
        operands,
        text,
    })
}

fn read_exact(source: &dyn InstructionSource, addr: Address, size: usize) -> Result<Vec<u8>, DecodeError> {
    if size == 0 {
        return Err(DecodeError::ZeroSize(addr));
    }
    let bytes = source.read_bytes(addr, size)?;
    if bytes.len() != size {
        return Err(DecodeError::ShortRead {
            addr,
            expected: size,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
