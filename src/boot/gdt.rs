//! Global Descriptor Table for a flat 64-bit guest.
//!
//! Segmentation is mostly ignored in long mode, but the CPU still loads CS/SS
//! from descriptors and uses their DPL to decide the current privilege level.
//! The guest runs in ring 3 and traps into ring 0 only through SYSCALL and the
//! exception gates, so the table carries a kernel pair, a user pair and the
//! 16-byte TSS descriptor:
//!
//! ```text
//! 0x00  NULL
//! 0x08  kernel code (64-bit)     <- STAR[47:32], SYSCALL CS
//! 0x10  kernel data              <- SYSCALL SS
//! 0x18  user code (32-bit)       <- STAR[63:48], SYSRET base
//! 0x20  user data                <- SYSRET SS (0x18 + 8)
//! 0x28  user code (64-bit)       <- SYSRET CS (0x18 + 16)
//! 0x30  TSS (low)                <- TR
//! 0x38  TSS (high)
//! ```
//!
//! Every descriptor has its accessed bit preset. The GDT lives on a page the
//! guest cannot write, so the CPU must never need to update it.

use super::layout;
use super::BootError;
use kvm_bindings::kvm_segment;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

pub const KERNEL_CODE_INDEX: u8 = 1;
pub const KERNEL_DATA_INDEX: u8 = 2;
pub const USER_CODE32_INDEX: u8 = 3;
pub const USER_DATA_INDEX: u8 = 4;
pub const USER_CODE64_INDEX: u8 = 5;
pub const TSS_INDEX: u8 = 6;

/// Selector loaded into TR.
pub const TSS_SELECTOR: u16 = (TSS_INDEX as u16) * 8;

/// Number of 8-byte slots, counting both halves of the TSS descriptor.
pub const GDT_ENTRIES: usize = 8;

/// Value of the GDTR limit field.
pub const GDT_LIMIT: u16 = (GDT_ENTRIES * 8 - 1) as u16;

/// Segment descriptors, excluding the system (TSS) descriptor.
pub const GDT_TABLE: [u64; 6] = [
    gdt_entry(0, 0, 0),            // 0x00: NULL
    gdt_entry(0xa09b, 0, 0xfffff), // 0x08: kernel code, L=1, DPL 0
    gdt_entry(0xc093, 0, 0xfffff), // 0x10: kernel data, DPL 0
    gdt_entry(0xc0fb, 0, 0xfffff), // 0x18: user code32, DPL 3
    gdt_entry(0xc0f3, 0, 0xfffff), // 0x20: user data, DPL 3
    gdt_entry(0xa0fb, 0, 0xfffff), // 0x28: user code64, L=1, DPL 3
];

/// Construct a GDT entry from packed flags, base and limit.
pub const fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((base as u64 & 0xff00_0000) << 32)
        | ((base as u64 & 0x00ff_ffff) << 16)
        | (limit as u64 & 0x0000_ffff)
        | (((limit as u64 & 0x000f_0000) >> 16) << 48)
        | ((flags as u64) << 40)
}

/// Build the two halves of a 64-bit available-TSS descriptor.
pub const fn tss_descriptor(base: u64, limit: u32) -> [u64; 2] {
    [gdt_entry(0x0089, base as u32, limit), base >> 32]
}

/// Decode a GDT entry into the segment format KVM expects.
///
/// The selector carries the descriptor's DPL as its RPL so that user
/// segments come out as 0x23/0x2b.
pub fn kvm_segment_from_gdt(entry: u64, table_index: u8) -> kvm_segment {
    let dpl = ((entry >> 45) & 0x3) as u8;
    kvm_segment {
        base: ((entry >> 16) & 0xff_ffff) | (((entry >> 56) & 0xff) << 24),
        limit: ((entry & 0xffff) | (((entry >> 48) & 0xf) << 16)) as u32,
        selector: u16::from(table_index) * 8 | u16::from(dpl),
        type_: ((entry >> 40) & 0xf) as u8,
        present: ((entry >> 47) & 0x1) as u8,
        dpl,
        db: ((entry >> 54) & 0x1) as u8,
        s: ((entry >> 44) & 0x1) as u8,
        l: ((entry >> 53) & 0x1) as u8,
        g: ((entry >> 55) & 0x1) as u8,
        ..Default::default()
    }
}

pub fn kernel_code_segment() -> kvm_segment {
    kvm_segment_from_gdt(GDT_TABLE[KERNEL_CODE_INDEX as usize], KERNEL_CODE_INDEX)
}

pub fn kernel_data_segment() -> kvm_segment {
    kvm_segment_from_gdt(GDT_TABLE[KERNEL_DATA_INDEX as usize], KERNEL_DATA_INDEX)
}

pub fn user_code_segment() -> kvm_segment {
    kvm_segment_from_gdt(GDT_TABLE[USER_CODE64_INDEX as usize], USER_CODE64_INDEX)
}

pub fn user_data_segment() -> kvm_segment {
    kvm_segment_from_gdt(GDT_TABLE[USER_DATA_INDEX as usize], USER_DATA_INDEX)
}

/// Write the GDT, including the primary TSS descriptor, into guest memory.
pub fn setup_gdt(memory: &GuestMemoryMmap) -> Result<(), BootError> {
    let mut table = [0u64; GDT_ENTRIES];
    table[..GDT_TABLE.len()].copy_from_slice(&GDT_TABLE);
    let tss = tss_descriptor(layout::TSS_ADDR, super::tss::TSS_LIMIT);
    table[TSS_INDEX as usize] = tss[0];
    table[TSS_INDEX as usize + 1] = tss[1];

    for (i, entry) in table.iter().enumerate() {
        memory.write_obj(*entry, GuestAddress(layout::GDT_ADDR + i as u64 * 8))?;
    }
    Ok(())
}
