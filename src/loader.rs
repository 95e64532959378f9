//! Guest binary loader.
//!
//! Two formats are accepted:
//!
//! 1. **Static ELF64** (`ET_EXEC`, x86-64): every `PT_LOAD` program header
//!    becomes one [`Segment`] with the permissions from its `p_flags`.
//! 2. **Flat image**: anything without the ELF magic is loaded verbatim at
//!    [`BINARY_BASE`] as a single read-only, executable segment whose entry
//!    point is its first byte.
//!
//! ```text
//! ELF64 header (64 bytes)
//! +0x00  e_ident     "\x7fELF", class 2 (64-bit), data 1 (little endian)
//! +0x10  e_type      2 = ET_EXEC
//! +0x12  e_machine   62 = x86-64
//! +0x18  e_entry
//! +0x20  e_phoff
//! +0x36  e_phentsize 56
//! +0x38  e_phnum
//! ```
//!
//! Segments are identity mapped, so each must sit at or above
//! [`BINARY_BASE`]; everything below belongs to the boot environment.

use crate::boot::layout::BINARY_BASE;
use crate::boot::paging::PagePermissions;
use crate::boot::SegmentMapping;
use std::path::Path;
use thiserror::Error;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;
const ELF_DATA_LE: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const ELF_HEADER_SIZE: usize = 64;
const PROGRAM_HEADER_SIZE: usize = 56;

const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Failed to read guest binary: {0}")]
    Read(#[from] std::io::Error),

    #[error("Guest binary is empty")]
    Empty,

    #[error("Invalid ELF: {0}")]
    InvalidElf(String),

    #[error("Segment at {vaddr:#x} lies below the binary base {base:#x}")]
    SegmentBelowBase { vaddr: u64, base: u64 },
}

/// One loadable segment of the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: u64,
    pub offset: usize,
    pub file_size: usize,
    pub mem_size: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

impl Segment {
    /// Page-table mapping for this segment.
    pub fn mapping(&self) -> SegmentMapping {
        SegmentMapping {
            vaddr: self.vaddr,
            size: self.mem_size,
            perms: PagePermissions::user(self.writable, self.executable),
        }
    }
}

/// A parsed guest binary, ready to be copied into guest memory.
#[derive(Debug, Clone)]
pub struct LoadedBinary {
    bytes: Vec<u8>,
    pub entry: u64,
    pub segments: Vec<Segment>,
    /// First byte after the highest segment.
    pub end: u64,
}

impl LoadedBinary {
    /// File contents backing `segment`. Bytes beyond this up to
    /// `mem_size` are zero.
    pub fn segment_data(&self, segment: &Segment) -> &[u8] {
        &self.bytes[segment.offset..segment.offset + segment.file_size]
    }

    pub fn mappings(&self) -> Vec<SegmentMapping> {
        self.segments.iter().map(Segment::mapping).collect()
    }

    pub fn is_elf(&self) -> bool {
        self.bytes.starts_with(&ELF_MAGIC)
    }
}

/// Read and parse a binary from disk.
pub fn load_file(path: impl AsRef<Path>) -> Result<LoadedBinary, LoaderError> {
    let bytes = std::fs::read(path.as_ref())?;
    tracing::debug!(
        path = %path.as_ref().display(),
        size = bytes.len(),
        "read guest binary"
    );
    load(bytes)
}

/// Parse `bytes` as a static ELF64 executable or a flat image.
pub fn load(bytes: Vec<u8>) -> Result<LoadedBinary, LoaderError> {
    if bytes.is_empty() {
        return Err(LoaderError::Empty);
    }
    if bytes.starts_with(&ELF_MAGIC) {
        return load_elf(bytes);
    }

    let size = bytes.len();
    let segment = Segment {
        vaddr: BINARY_BASE,
        offset: 0,
        file_size: size,
        mem_size: size as u64,
        readable: true,
        writable: false,
        executable: true,
    };
    Ok(LoadedBinary {
        bytes,
        entry: BINARY_BASE,
        segments: vec![segment],
        end: BINARY_BASE + size as u64,
    })
}

fn u16_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(b)
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(b)
}

fn load_elf(bytes: Vec<u8>) -> Result<LoadedBinary, LoaderError> {
    let invalid = |msg: String| LoaderError::InvalidElf(msg);

    if bytes.len() < ELF_HEADER_SIZE {
        return Err(invalid("file too small for ELF header".into()));
    }
    if bytes[4] != ELF_CLASS_64 || bytes[5] != ELF_DATA_LE {
        return Err(invalid("not a little-endian ELF64 file".into()));
    }
    let e_type = u16_at(&bytes, 0x10);
    if e_type != ET_EXEC {
        return Err(invalid(format!(
            "unsupported ELF type {e_type} (only static executables)"
        )));
    }
    let machine = u16_at(&bytes, 0x12);
    if machine != EM_X86_64 {
        return Err(invalid(format!("unsupported machine {machine}")));
    }

    let entry = u64_at(&bytes, 0x18);
    let phoff = u64_at(&bytes, 0x20) as usize;
    let phentsize = u16_at(&bytes, 0x36) as usize;
    let phnum = u16_at(&bytes, 0x38) as usize;
    if phentsize != PROGRAM_HEADER_SIZE {
        return Err(invalid(format!("unexpected program header size {phentsize}")));
    }
    let table_end = phoff
        .checked_add(phnum * phentsize)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| invalid("program headers extend past end of file".into()))?;

    let mut segments = Vec::new();
    for ph in bytes[phoff..table_end].chunks_exact(PROGRAM_HEADER_SIZE) {
        if u32_at(ph, 0x00) != PT_LOAD {
            continue;
        }
        let flags = u32_at(ph, 0x04);
        let offset = u64_at(ph, 0x08) as usize;
        let vaddr = u64_at(ph, 0x10);
        let file_size = u64_at(ph, 0x20) as usize;
        let mem_size = u64_at(ph, 0x28);

        if vaddr < BINARY_BASE {
            return Err(LoaderError::SegmentBelowBase {
                vaddr,
                base: BINARY_BASE,
            });
        }
        if offset.checked_add(file_size).map_or(true, |end| end > bytes.len()) {
            return Err(invalid(format!("segment at {vaddr:#x} extends past end of file")));
        }
        if (file_size as u64) > mem_size {
            return Err(invalid(format!(
                "segment at {vaddr:#x} has file size larger than memory size"
            )));
        }
        segments.push(Segment {
            vaddr,
            offset,
            file_size,
            mem_size,
            readable: flags & PF_R != 0,
            writable: flags & PF_W != 0,
            executable: flags & PF_X != 0,
        });
    }
    if segments.is_empty() {
        return Err(invalid("no loadable segments".into()));
    }

    let end = segments
        .iter()
        .map(|s| s.vaddr + s.mem_size)
        .max()
        .unwrap_or(BINARY_BASE);

    tracing::debug!(
        entry = format_args!("{entry:#x}"),
        segments = segments.len(),
        end = format_args!("{end:#x}"),
        "parsed ELF executable"
    );
    Ok(LoadedBinary {
        bytes,
        entry,
        segments,
        end,
    })
}
