//! Operand-wildcarding policy for a single instruction

use crate::Operand;
use super::PatternToken;

/// Turn one instruction into pattern tokens.
///
/// With `auto_wildcard` off, or no position-dependent operand among the first
/// two, every byte is literal. Otherwise the bytes from the first dependent
/// operand's encoding onwards are replaced by wildcard runs. Operand 1 decides
/// the split point; operand 2 only affects the tail after operand 1's span.
///
/// # Arguments
/// * `bytes` - Raw instruction bytes; their length is the instruction size
/// * `operands` - Decoded operands in operand order
/// * `auto_wildcard` - Whether dependent operands are wildcarded at all
pub fn instruction_tokens(bytes: &[u8], operands: &[Operand], auto_wildcard: bool) -> Vec<PatternToken> {
    let op1 = operands.first();
    let op2 = operands.get(1);

    if !auto_wildcard || !(is_dependent(op1) || is_dependent(op2)) {
        return literal(bytes);
    }

    let size = bytes.len();

    match (op1, op2) {
        // Nothing but dependent operands, no literal prefix
        (Some(a), Some(b))
            if a.is_position_dependent()
                && b.is_position_dependent()
                && a.encoding_offset == 0
                && b.encoding_offset == 0 =>
        {
            vec![PatternToken::Wildcard(size)]
        }
        (Some(a), _) if a.is_position_dependent() => split_on_first(bytes, a, op2),
        (_, Some(b)) if b.is_position_dependent() => {
            let start = b.encoding_offset.min(size);
            let mut tokens = literal(&bytes[..start]);
            push_run(&mut tokens, size - start);
            tokens
        }
        _ => literal(bytes),
    }
}

fn split_on_first(bytes: &[u8], op1: &Operand, op2: Option<&Operand>) -> Vec<PatternToken> {
    let size = bytes.len();
    let start = op1.encoding_offset.min(size);
    let span_end = match op2 {
        Some(b) if b.encoding_offset > start => b.encoding_offset.min(size),
        _ => size,
    };

    let mut tokens = literal(&bytes[..start]);
    push_run(&mut tokens, span_end - start);

    // Only reachable when operand 2 starts after operand 1's span
    if let Some(b) = op2.filter(|_| span_end < size) {
        if b.is_position_dependent() {
            push_run(&mut tokens, size - span_end);
        } else {
            tokens.extend(literal(&bytes[span_end..]));
        }
    }

    tokens
}

fn is_dependent(op: Option<&Operand>) -> bool {
    op.is_some_and(Operand::is_position_dependent)
}

fn literal(bytes: &[u8]) -> Vec<PatternToken> {
    bytes.iter().copied().map(PatternToken::Byte).collect()
}

fn push_run(tokens: &mut Vec<PatternToken>, len: usize) {
    if len > 0 {
        tokens.push(PatternToken::Wildcard(len));
    }
}
