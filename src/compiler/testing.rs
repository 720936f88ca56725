//! Scripted instruction source for tests

use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::{Address, DecodeError, DecodedInsn, InstructionSource, Operand, BAD_ADDRESS};

/// What the scripted source reports at one address.
#[derive(Debug, Clone)]
pub(crate) enum FakeUnit {
    Code {
        bytes: Vec<u8>,
        operands: Vec<Operand>,
        text: String,
    },
    Data(Vec<u8>),
    /// Code that fails to decode; `size` is still reported for the walk
    Broken { size: usize },
}

/// In-memory [`InstructionSource`] that records every query.
#[derive(Debug, Default)]
pub(crate) struct FakeSource {
    units: BTreeMap<Address, FakeUnit>,
    boundaries: BTreeMap<Address, Address>,
    pub(crate) queried: RefCell<Vec<Address>>,
    pub(crate) decode_calls: RefCell<usize>,
}

impl FakeSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn code(mut self, addr: Address, bytes: &[u8], operands: &[Operand], text: &str) -> Self {
        self.units.insert(
            addr,
            FakeUnit::Code {
                bytes: bytes.to_vec(),
                operands: operands.to_vec(),
                text: text.to_string(),
            },
        );
        self
    }

    pub(crate) fn data(mut self, addr: Address, bytes: &[u8]) -> Self {
        self.units.insert(addr, FakeUnit::Data(bytes.to_vec()));
        self
    }

    pub(crate) fn broken(mut self, addr: Address, size: usize) -> Self {
        self.units.insert(addr, FakeUnit::Broken { size });
        self
    }

    /// Force `next_unit_boundary(addr, _)` to answer `next`.
    pub(crate) fn boundary(mut self, addr: Address, next: Address) -> Self {
        self.boundaries.insert(addr, next);
        self
    }

    /// `count` one-byte NOPs starting at `addr`.
    pub(crate) fn nops(mut self, addr: Address, count: u64) -> Self {
        for i in 0..count {
            self = self.code(addr + i, &[0x90], &[], "nop");
        }
        self
    }

    fn unit(&self, addr: Address) -> Option<&FakeUnit> {
        self.units.get(&addr)
    }
}

impl InstructionSource for FakeSource {
    fn is_code(&self, addr: Address) -> bool {
        self.queried.borrow_mut().push(addr);
        !matches!(self.unit(addr), Some(FakeUnit::Data(_)))
    }

    fn unit_size(&self, addr: Address) -> usize {
        match self.unit(addr) {
            Some(FakeUnit::Code { bytes, .. }) | Some(FakeUnit::Data(bytes)) => bytes.len(),
            Some(FakeUnit::Broken { size }) => *size,
            None => 1,
        }
    }

    fn read_bytes(&self, addr: Address, size: usize) -> Result<Vec<u8>, DecodeError> {
        match self.unit(addr) {
            Some(FakeUnit::Code { bytes, .. }) | Some(FakeUnit::Data(bytes)) => {
                Ok(bytes.iter().copied().take(size).collect())
            }
            _ => Err(DecodeError::Unmapped(addr)),
        }
    }

    fn decode_instruction(&self, addr: Address) -> Result<DecodedInsn, DecodeError> {
        *self.decode_calls.borrow_mut() += 1;
        match self.unit(addr) {
            Some(FakeUnit::Code { bytes, operands, .. }) => Ok(DecodedInsn {
                size: bytes.len(),
                operands: operands.clone(),
            }),
            _ => Err(DecodeError::InvalidInstruction(addr)),
        }
    }

    fn disassembly_text(&self, addr: Address) -> Result<String, DecodeError> {
        match self.unit(addr) {
            Some(FakeUnit::Code { text, .. }) => Ok(text.clone()),
            _ => Err(DecodeError::Format {
                addr,
                reason: "no text".into(),
            }),
        }
    }

    fn next_unit_boundary(&self, addr: Address, limit: Address) -> Address {
        if let Some(next) = self.boundaries.get(&addr) {
            return *next;
        }
        let next = addr + self.unit_size(addr) as Address;
        if next < limit {
            next
        } else {
            BAD_ADDRESS
        }
    }
}
