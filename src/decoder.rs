//! iced-x86 backed instruction source over a loaded image.

use std::cell::RefCell;
use std::collections::HashMap;

use iced_x86::{ConstantOffsets, Decoder, DecoderOptions, Formatter, Instruction, NasmFormatter, OpKind, Register};

use crate::parser::BinaryImage;
use crate::{Address, DecodeError, DecodedInsn, InstructionSource, Operand, OperandKind, BAD_ADDRESS, MAX_OPERANDS};

/// Longest legal x86 instruction
pub const MAX_INSTRUCTION_SIZE: usize = 15;

/// Decodes x86 code straight out of a [`BinaryImage`].
///
/// Executable segments are treated as code; everything else is data, one
/// byte per unit.
pub struct X86Source<'a> {
    image: &'a BinaryImage,
    // Decoded instructions keyed by address; every query for a unit hits
    // the same address several times
    cache: RefCell<HashMap<Address, (Instruction, ConstantOffsets)>>,
}

impl<'a> X86Source<'a> {
    /// Create a source over `image`
    pub fn new(image: &'a BinaryImage) -> Self {
        Self {
            image,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// The underlying image
    pub fn image(&self) -> &BinaryImage {
        self.image
    }

    fn decode_at(&self, addr: Address) -> Result<(Instruction, ConstantOffsets), DecodeError> {
        if let Some(hit) = self.cache.borrow().get(&addr) {
            return Ok(*hit);
        }

        let window = self
            .image
            .read(addr, MAX_INSTRUCTION_SIZE)
            .ok_or(DecodeError::Unmapped(addr))?;
        let mut decoder = Decoder::try_with_ip(self.image.bitness, window, addr, DecoderOptions::NONE)
            .map_err(|e| DecodeError::Format {
                addr,
                reason: e.to_string(),
            })?;

        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(DecodeError::InvalidInstruction(addr));
        }
        let offsets = decoder.get_constant_offsets(&instr);

        self.cache.borrow_mut().insert(addr, (instr, offsets));
        Ok((instr, offsets))
    }
}

impl std::fmt::Debug for X86Source<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X86Source")
            .field("bitness", &self.image.bitness)
            .field("segments", &self.image.segments.len())
            .finish()
    }
}

impl InstructionSource for X86Source<'_> {
    fn is_code(&self, addr: Address) -> bool {
        self.image.is_executable(addr)
    }

    fn unit_size(&self, addr: Address) -> usize {
        if !self.is_code(addr) {
            return 1;
        }
        self.decode_at(addr).map(|(instr, _)| instr.len()).unwrap_or(1)
    }

    fn read_bytes(&self, addr: Address, size: usize) -> Result<Vec<u8>, DecodeError> {
        self.image
            .read(addr, size)
            .map(<[u8]>::to_vec)
            .ok_or(DecodeError::Unmapped(addr))
    }

    fn decode_instruction(&self, addr: Address) -> Result<DecodedInsn, DecodeError> {
        let (instr, offsets) = self.decode_at(addr)?;
        let count = (instr.op_count() as usize).min(MAX_OPERANDS);
        let operands = (0..count as u32).map(|n| operand(&instr, &offsets, n)).collect();

        Ok(DecodedInsn {
            size: instr.len(),
            operands,
        })
    }

    fn disassembly_text(&self, addr: Address) -> Result<String, DecodeError> {
        let (instr, _) = self.decode_at(addr)?;
        let mut formatter = NasmFormatter::new();
        let mut output = String::new();
        formatter.format(&instr, &mut output);
        Ok(output)
    }

    fn next_unit_boundary(&self, addr: Address, limit: Address) -> Address {
        if self.image.segment_at(addr).is_none() {
            return BAD_ADDRESS;
        }
        let next = addr.saturating_add(self.unit_size(addr) as Address);
        if next < limit {
            next
        } else {
            BAD_ADDRESS
        }
    }
}

/// Map iced's view of operand `n` onto an [`Operand`].
fn operand(instr: &Instruction, offsets: &ConstantOffsets, n: u32) -> Operand {
    match instr.op_kind(n) {
        OpKind::Register => Operand::new(OperandKind::Register, 0),
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
            Operand::new(OperandKind::NearBranch, offsets.immediate_offset())
        }
        OpKind::FarBranch16 | OpKind::FarBranch32 => Operand::new(OperandKind::FarBranch, offsets.immediate_offset()),
        OpKind::Immediate8_2nd => Operand::new(OperandKind::Immediate, offsets.immediate_offset2()),
        OpKind::Immediate8
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate64
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32
        | OpKind::Immediate8to64
        | OpKind::Immediate32to64 => Operand::new(OperandKind::Immediate, offsets.immediate_offset()),
        OpKind::Memory => memory_operand(instr, offsets),
        // String instructions address through (r|e)si/(r|e)di implicitly
        OpKind::MemorySegSI
        | OpKind::MemorySegESI
        | OpKind::MemorySegRSI
        | OpKind::MemorySegDI
        | OpKind::MemorySegEDI
        | OpKind::MemorySegRDI
        | OpKind::MemoryESDI
        | OpKind::MemoryESEDI
        | OpKind::MemoryESRDI => Operand::new(OperandKind::Phrase, 0),
        _ => Operand::new(OperandKind::Other, 0),
    }
}

fn memory_operand(instr: &Instruction, offsets: &ConstantOffsets) -> Operand {
    let base = instr.memory_base();
    let index = instr.memory_index();
    let offset = if offsets.has_displacement() {
        offsets.displacement_offset()
    } else {
        0
    };

    let kind = if (base == Register::None && index == Register::None) || base.is_ip() {
        OperandKind::Memory
    } else if offsets.has_displacement() {
        OperandKind::Displacement
    } else {
        OperandKind::Phrase
    };
    Operand::new(kind, offset)
}
