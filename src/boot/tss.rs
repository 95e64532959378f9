//! Task State Segments.
//!
//! In long mode the TSS no longer describes a task. It only holds the stack
//! pointers the CPU switches to on a privilege change (RSP0-2) and the seven
//! Interrupt Stack Table entries. Every exception gate uses IST1, so each
//! vCPU needs its own TSS pointing at its own stack.
//!
//! ```text
//! IST_ADDR page (primary vCPU)
//! +0x1000  ist1   <- all exception gates
//! +0x0c00  ist2
//! +0x0800  rsp0 = rsp1 = rsp2
//!
//! IST_SMP_ADDR (one 0x400 slice per extra vCPU, c = id - 1)
//! top = IST_SMP_ADDR + 0x400 * (c + 1)
//! top          ist1
//! top - 0x100  ist2
//! top - 0x200  rsp0 = rsp1 = rsp2
//! ```

use super::layout;
use super::BootError;
use kvm_bindings::kvm_segment;
use vm_memory::{ByteValued, Bytes, GuestAddress, GuestMemoryMmap};

/// Size of the 64-bit TSS in bytes.
pub const TSS_SIZE: u64 = 104;

/// Value of the TR limit field.
pub const TSS_LIMIT: u32 = TSS_SIZE as u32 - 1;

/// An I/O map base at or beyond the limit means "no permission bitmap".
pub const IOMAP_UNUSED: u16 = TSS_SIZE as u16;

/// 64-bit Task State Segment.
#[repr(C, packed)]
#[derive(Clone, Copy, Default, Debug)]
pub struct Tss {
    reserved0: u32,
    pub rsp: [u64; 3],
    reserved1: u64,
    pub ist: [u64; 7],
    reserved2: u64,
    reserved3: u16,
    pub iomap_base: u16,
}

// SAFETY: plain-old-data with no padding, every bit pattern is valid.
unsafe impl ByteValued for Tss {}

/// Stack top reserved for one additional vCPU (`id` starts at 1).
pub fn smp_stack_top(id: u32) -> u64 {
    layout::IST_SMP_ADDR + layout::IST_SMP_STRIDE * u64::from(id)
}

/// Guest physical address of the TSS for additional vCPU `id`.
///
/// # Panics
///
/// Panics if `id` is 0 (the primary vCPU) or exceeds [`layout::SMP_MAX`].
pub fn smp_tss_address(id: u32) -> u64 {
    assert!(
        (1..=layout::SMP_MAX).contains(&id),
        "invalid SMP vCPU index {id}"
    );
    layout::TSS_SMP_ADDR + u64::from(id - 1) * TSS_SIZE
}

fn primary_tss() -> Tss {
    let rsp0 = layout::IST_ADDR + 0x800;
    Tss {
        rsp: [rsp0; 3],
        ist: [layout::IST_ADDR + 0x1000, layout::IST_ADDR + 0xc00, 0, 0, 0, 0, 0],
        iomap_base: IOMAP_UNUSED,
        ..Default::default()
    }
}

fn smp_tss(id: u32) -> Tss {
    let top = smp_stack_top(id);
    Tss {
        rsp: [top - 0x200; 3],
        ist: [top, top - 0x100, 0, 0, 0, 0, 0],
        iomap_base: IOMAP_UNUSED,
        ..Default::default()
    }
}

/// Write the primary TSS and the per-vCPU TSS array.
pub fn setup_tss(memory: &GuestMemoryMmap) -> Result<(), BootError> {
    memory.write_obj(primary_tss(), GuestAddress(layout::TSS_ADDR))?;
    for id in 1..=layout::SMP_MAX {
        memory.write_obj(smp_tss(id), GuestAddress(smp_tss_address(id)))?;
    }
    Ok(())
}

/// TR contents for a TSS at `base`.
pub fn tss_segment(base: u64) -> kvm_segment {
    kvm_segment {
        base,
        limit: TSS_LIMIT,
        selector: super::gdt::TSS_SELECTOR,
        type_: 11, // busy 64-bit TSS
        present: 1,
        dpl: 0,
        db: 0,
        s: 0,
        l: 0,
        g: 0,
        ..Default::default()
    }
}
