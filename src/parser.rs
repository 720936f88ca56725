//! Goblin-based loader that maps ELF, PE and Mach-O images into memory.

use std::fmt;
use goblin::{elf, pe, Object};
use goblin::mach::{Mach, MachO, constants::cputype};

use crate::Address;

/// Errors raised while loading an image
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// Goblin rejected the file
    #[error("Failed to parse binary format: {0}")]
    Goblin(#[from] goblin::error::Error),

    /// The container format is recognised but not handled
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    /// The machine type has no x86 decoder
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// A section points outside the file or the address space
    #[error("Section '{0}' lies outside the file or address space")]
    Truncated(String),
}

/// A mapped, contiguous run of bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Section or segment name
    pub name: String,
    /// Virtual address of the first byte
    pub address: Address,
    /// File-backed contents
    pub bytes: Vec<u8>,
    /// Whether the bytes are code
    pub executable: bool,
}

impl Segment {
    /// Create a new segment
    pub fn new(name: impl Into<String>, address: Address, bytes: Vec<u8>, executable: bool) -> Self {
        Self {
            name: name.into(),
            address,
            bytes,
            executable,
        }
    }

    /// Address just past the last byte
    pub fn end_address(&self) -> Address {
        self.address.saturating_add(self.bytes.len() as Address)
    }

    /// Returns true if `addr` falls inside the segment
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.address && addr < self.end_address()
    }
}

/// A loaded program image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryImage {
    /// Code bitness: 16, 32 or 64
    pub bitness: u32,
    /// Entry point address, if available
    pub entry_point: Option<Address>,
    /// Mapped segments in load order
    pub segments: Vec<Segment>,
}

impl BinaryImage {
    /// Treat `data` as one executable blob loaded at `base`.
    pub fn raw(data: &[u8], base: Address, bitness: u32) -> Self {
        Self {
            bitness,
            entry_point: Some(base),
            segments: vec![Segment::new("raw", base, data.to_vec(), true)],
        }
    }

    /// Segment containing `addr`
    pub fn segment_at(&self, addr: Address) -> Option<&Segment> {
        self.segments.iter().find(|s| s.contains(addr))
    }

    /// Up to `size` bytes at `addr`, never crossing a segment end.
    pub fn read(&self, addr: Address, size: usize) -> Option<&[u8]> {
        let segment = self.segment_at(addr)?;
        let start = (addr - segment.address) as usize;
        let end = start.saturating_add(size).min(segment.bytes.len());
        Some(&segment.bytes[start..end])
    }

    /// Returns true if `addr` lies in an executable segment
    pub fn is_executable(&self, addr: Address) -> bool {
        self.segment_at(addr).is_some_and(|s| s.executable)
    }

    /// Find a segment by name
    pub fn find_segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }
}

/// A parser that handles ELF, PE, and Mach-O via Goblin.
#[derive(Debug, Default)]
pub struct GoblinParser;

impl GoblinParser {
    /// Construct a new GoblinParser.
    pub fn new() -> Self {
        GoblinParser
    }

    /// Parse `data` into a mapped image.
    pub fn parse(&self, data: &[u8]) -> Result<BinaryImage, ParseError> {
        match Object::parse(data)? {
            Object::Elf(elf) => self.parse_elf(&elf, data),
            Object::PE(pe) => self.parse_pe(&pe, data),
            Object::Mach(m) => self.parse_mach(m),
            _ => Err(ParseError::UnsupportedFormat("not ELF, PE or Mach-O".into())),
        }
    }

    /// Parse an ELF image.
    fn parse_elf(&self, elf: &elf::Elf, data: &[u8]) -> Result<BinaryImage, ParseError> {
        let bitness = match elf.header.e_machine {
            elf::header::EM_386 => 32,
            elf::header::EM_X86_64 => 64,
            other => return Err(ParseError::UnsupportedArchitecture(format!("ELF e_machine {}", other))),
        };

        let mut segments = Vec::new();
        for sh in &elf.section_headers {
            if !sh.is_alloc() || sh.sh_type == elf::section_header::SHT_NOBITS || sh.sh_size == 0 {
                continue;
            }
            let name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("").to_string();
            let bytes = file_slice(data, sh.sh_offset, sh.sh_size, &name)?;
            segments.push(mapped_segment(name, Some(sh.sh_addr), bytes, sh.is_executable())?);
        }

        Ok(BinaryImage {
            bitness,
            entry_point: Some(elf.entry),
            segments,
        })
    }

    /// Parse a PE image.
    fn parse_pe(&self, pe: &pe::PE<'_>, data: &[u8]) -> Result<BinaryImage, ParseError> {
        let bitness = match pe.header.coff_header.machine {
            pe::header::COFF_MACHINE_X86 => 32,
            pe::header::COFF_MACHINE_X86_64 => 64,
            other => return Err(ParseError::UnsupportedArchitecture(format!("PE machine 0x{:x}", other))),
        };
        let image_base = pe.image_base as Address;

        let mut segments = Vec::new();
        for sect in &pe.sections {
            let name = sect.name().unwrap_or("").to_string();
            let raw_size = match sect.virtual_size {
                0 => sect.size_of_raw_data,
                v => v.min(sect.size_of_raw_data),
            };
            if raw_size == 0 {
                continue;
            }
            let bytes = file_slice(data, sect.pointer_to_raw_data as u64, raw_size as u64, &name)?;
            let executable = sect.characteristics
                & (pe::section_table::IMAGE_SCN_MEM_EXECUTE | pe::section_table::IMAGE_SCN_CNT_CODE)
                != 0;
            let address = image_base.checked_add(sect.virtual_address as Address);
            segments.push(mapped_segment(name, address, bytes, executable)?);
        }

        Ok(BinaryImage {
            bitness,
            entry_point: image_base.checked_add(pe.entry as Address),
            segments,
        })
    }

    /// Parse a Mach-O binary
    fn parse_macho(&self, macho: &MachO) -> Result<BinaryImage, ParseError> {
        let bitness = match macho.header.cputype {
            cputype::CPU_TYPE_I386 => 32,
            cputype::CPU_TYPE_X86_64 => 64,
            other => return Err(ParseError::UnsupportedArchitecture(format!("Mach-O cputype {}", other))),
        };

        let mut segments = Vec::new();
        for segment in &macho.segments {
            // VM_PROT_EXECUTE
            let segment_exec = (segment.initprot & 0x4) != 0;
            for (section, bytes) in segment.sections()? {
                if bytes.is_empty() {
                    continue;
                }
                let name = format!(
                    "{},{}",
                    section.segname().unwrap_or(""),
                    section.name().unwrap_or("")
                );
                // S_ATTR_PURE_INSTRUCTIONS
                let pure_code = section.flags & 0x8000_0000 != 0;
                segments.push(mapped_segment(name, Some(section.addr), bytes.to_vec(), segment_exec || pure_code)?);
            }
        }

        Ok(BinaryImage {
            bitness,
            entry_point: Some(macho.entry),
            segments,
        })
    }

    /// Parse a Mach-O image.
    fn parse_mach(&self, m: Mach<'_>) -> Result<BinaryImage, ParseError> {
        match m {
            Mach::Binary(binary) => self.parse_macho(&binary),
            Mach::Fat(_) => Err(ParseError::UnsupportedFormat(
                "fat Mach-O; extract a single architecture first".into(),
            )),
        }
    }
}

impl fmt::Display for GoblinParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GoblinParser")
    }
}

/// A segment whose whole extent fits in the address space
fn mapped_segment(name: String, address: Option<Address>, bytes: Vec<u8>, executable: bool) -> Result<Segment, ParseError> {
    match address {
        Some(addr) if addr.checked_add(bytes.len() as Address).is_some() => {
            Ok(Segment::new(name, addr, bytes, executable))
        }
        _ => Err(ParseError::Truncated(name)),
    }
}

fn file_slice(data: &[u8], offset: u64, size: u64, name: &str) -> Result<Vec<u8>, ParseError> {
    let start = usize::try_from(offset).map_err(|_| ParseError::Truncated(name.to_string()))?;
    let len = usize::try_from(size).map_err(|_| ParseError::Truncated(name.to_string()))?;
    data.get(start..start.saturating_add(len))
        .map(<[u8]>::to_vec)
        .ok_or_else(|| ParseError::Truncated(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> BinaryImage {
        BinaryImage {
            bitness: 32,
            entry_point: Some(0x1000),
            segments: vec![
                Segment::new(".text", 0x1000, vec![0x55, 0x8b, 0xec, 0xc3], true),
                Segment::new(".data", 0x2000, vec![1, 2, 3, 4, 5, 6], false),
            ],
        }
    }

    #[test]
    fn test_raw_image() {
        let img = BinaryImage::raw(&[0x90, 0xc3], 0x400000, 64);
        assert_eq!(img.bitness, 64);
        assert_eq!(img.segments.len(), 1);
        assert!(img.is_executable(0x400001));
        assert!(!img.is_executable(0x400002));
    }

    #[test]
    fn test_segment_lookup() {
        let img = image();
        assert_eq!(img.segment_at(0x1003).map(|s| s.name.as_str()), Some(".text"));
        assert!(img.segment_at(0x1004).is_none());
        assert!(!img.is_executable(0x2000));
        assert_eq!(img.find_segment(".data").map(|s| s.end_address()), Some(0x2006));
    }

    #[test]
    fn test_read_clamps_to_segment() {
        let img = image();
        assert_eq!(img.read(0x1001, 2), Some(&[0x8b, 0xec][..]));
        assert_eq!(img.read(0x2004, 10), Some(&[5, 6][..]));
        assert_eq!(img.read(0x3000, 1), None);
    }

    #[test]
    fn test_rejects_garbage() {
        let parser = GoblinParser::new();
        assert!(parser.parse(b"definitely not an executable").is_err());
    }

    #[test]
    fn test_segment_past_address_space() {
        let top = Address::MAX - 1;
        assert!(matches!(
            mapped_segment(".text".into(), Some(top), vec![0x90; 4], true),
            Err(ParseError::Truncated(name)) if name == ".text"
        ));
        assert!(matches!(
            mapped_segment(".text".into(), None, vec![0x90], true),
            Err(ParseError::Truncated(_))
        ));
        assert_eq!(
            mapped_segment(".text".into(), Some(top), vec![0x90], true).unwrap().end_address(),
            Address::MAX
        );

        let seg = Segment::new("wrap", top, vec![0; 8], false);
        assert_eq!(seg.end_address(), Address::MAX);
        assert!(seg.contains(top));
    }

    #[test]
    fn test_file_slice_bounds() {
        let data = [0u8; 8];
        assert_eq!(file_slice(&data, 2, 4, "x").unwrap().len(), 4);
        assert!(matches!(file_slice(&data, 6, 4, "x"), Err(ParseError::Truncated(_))));
    }
}
