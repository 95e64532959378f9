//! Boot environment for a 64-bit user-mode guest.
//!
//! The guest is not an operating system. It is a single program that runs in
//! ring 3 under long mode, with a few hundred bytes of host-provided ring-0
//! glue that forwards system calls and exceptions to the VMM through port I/O.
//! This module writes every structure the CPU needs for that into guest
//! memory, and computes the special registers that bind them.
//!
//! # Memory Layout
//!
//! ```text
//! 0x0000_0000 - 0x0000_1000  Never mapped (null page)
//! 0x0000_1600 - 0x0000_1640  GDT
//! 0x0000_1700 - 0x0000_1768  Primary TSS
//! 0x0000_1800 - 0x0000_1a10  IDT (33 gates)
//! 0x0000_2000 - 0x0000_2200  Interrupt trampolines (supervisor, executable)
//! 0x0000_3000 - 0x0000_3004  Exit stub (user, executable)
//! 0x0000_3800 - 0x0000_3900  Per-vCPU table (user, read-only)
//! 0x0000_4000 - 0x0000_4618  SMP TSS array (15 x 104 bytes)
//! 0x0000_5000 - 0x0000_6000  Primary interrupt stacks
//! 0x0000_6000 - 0x0000_a000  SMP interrupt stacks (0x400 per vCPU)
//! 0x0000_a000 - 0x0010_0000  Page-table arena, PML4 first
//! 0x0010_0000 - binary_end   Loaded binary
//! binary_end  - max_mem      Heap and stack (user, writable)
//! 0xffff_a000                vsyscall page (slot 1, read-only)
//! 0xffff_c000                KVM identity map page
//! 0xffff_d000                KVM TSS pages
//! 0x70_0000_0000 -           Memory banks (slots 2+)
//! ```
//!
//! Everything below 1MB is supervisor-only, so the guest can never rewrite
//! its own descriptor tables or page tables.
//!
//! # Setup Order
//!
//! [`setup_long_mode`] writes the GDT, the TSS array, the IDT, the
//! trampolines and finally the page tables. The writes are independent; the
//! page tables are last only because they decide the "kernel end" address.
//! [`long_mode_sregs`] then derives the special registers from a vCPU's
//! current state. No KVM call happens in this module.

pub mod gdt;
pub mod idt;
pub mod paging;
pub mod trampoline;
pub mod tss;

use crate::kvm::HostFeatures;
use kvm_bindings::{kvm_dtable, kvm_sregs};
use paging::{
    map_range, ArenaPages, PageArena, PagePermissions, PageTableMemory, PagingError,
    VirtualRemapping,
};
use thiserror::Error;
use vm_memory::{GuestMemoryError, GuestMemoryMmap};

/// Guest physical memory layout constants.
pub mod layout {
    pub const PAGE_SIZE: u64 = 0x1000;
    pub const HUGE_PAGE_SIZE: u64 = 0x20_0000;

    /// GDT location. Shares the read-only page at 0x1000 with the TSS and IDT.
    pub const GDT_ADDR: u64 = 0x1600;

    /// Primary TSS location.
    pub const TSS_ADDR: u64 = 0x1700;

    /// IDT location.
    pub const IDT_ADDR: u64 = 0x1800;

    /// Interrupt trampoline blob (syscall entry and exception slots).
    pub const INTR_ASM_ADDR: u64 = 0x2000;

    /// User-executable page holding the exit stub.
    pub const USER_ASM_ADDR: u64 = 0x3000;

    /// Per-vCPU TSS array for additional processors.
    pub const TSS_SMP_ADDR: u64 = 0x4000;

    /// Interrupt stack page of the primary vCPU.
    pub const IST_ADDR: u64 = 0x5000;

    /// Interrupt stacks of additional processors.
    pub const IST_SMP_ADDR: u64 = 0x6000;
    pub const IST_SMP_STRIDE: u64 = 0x400;

    /// Maximum number of additional processors.
    pub const SMP_MAX: u32 = 15;

    /// Main PML4, first page of the page-table arena.
    pub const PT_ADDR: u64 = 0xa000;
    pub const PT_ARENA_END: u64 = 0x10_0000;

    /// Load address of the guest binary.
    pub const BINARY_BASE: u64 = 0x10_0000;

    /// Guest physical page holding the vsyscall stubs.
    pub const VSYSCALL_PHYS: u64 = 0xffff_a000;

    /// Fixed virtual address of the legacy vsyscall page.
    pub const VSYSCALL_VIRT: u64 = 0xffff_ffff_ff60_0000;

    /// Reserved for KVM's real-mode identity map.
    pub const KVM_IDENTITY_MAP_ADDR: u64 = 0xffff_c000;

    /// Reserved for KVM's real-mode TSS (three pages).
    pub const KVM_TSS_ADDR: u64 = 0xffff_d000;

    /// Default guest memory size (64MB).
    pub const DEFAULT_MAX_MEM: u64 = 64 << 20;
}

/// Errors that can occur while writing the boot environment.
#[derive(Error, Debug)]
pub enum BootError {
    #[error("Failed to write boot structures: {0}")]
    Memory(#[from] GuestMemoryError),

    #[error("Failed to build page tables: {0}")]
    Paging(#[from] PagingError),

    #[error("Segment {vaddr:#x}+{size:#x} lies outside guest memory ({max_mem:#x})")]
    SegmentOutOfRange { vaddr: u64, size: u64, max_mem: u64 },

    #[error("Guest memory too small: {max_mem:#x} bytes, binary ends at {binary_end:#x}")]
    MemoryTooSmall { max_mem: u64, binary_end: u64 },
}

/// One loaded segment, identity mapped with its own permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentMapping {
    pub vaddr: u64,
    pub size: u64,
    pub perms: PagePermissions,
}

/// Inputs of the boot environment.
#[derive(Debug, Clone, Copy)]
pub struct BootSetup<'a> {
    pub segments: &'a [SegmentMapping],
    /// First byte after the loaded binary; the heap starts on the next page.
    pub binary_end: u64,
    pub max_mem: u64,
    pub remappings: &'a [VirtualRemapping],
    pub split_hugepages: bool,
}

/// What the boot environment claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo {
    /// Highest guest physical address used by boot structures.
    pub kernel_end: u64,
    /// Root of the page tables (CR3).
    pub page_tables: u64,
}

#[inline]
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(layout::PAGE_SIZE - 1)
}

#[inline]
pub const fn page_align_up(addr: u64) -> u64 {
    page_align_down(addr + layout::PAGE_SIZE - 1)
}

/// Write descriptor tables, trampolines and page tables into `memory`.
pub fn setup_long_mode(
    memory: &GuestMemoryMmap,
    arena: &mut PageArena,
    setup: &BootSetup<'_>,
) -> Result<BootInfo, BootError> {
    gdt::setup_gdt(memory)?;
    tss::setup_tss(memory)?;
    idt::setup_idt(memory)?;
    trampoline::setup_trampolines(memory)?;

    let mut pages = ArenaPages::new(memory, arena);
    let root = setup_page_tables(&mut pages, setup)?;
    let kernel_end = arena.next();

    tracing::debug!(
        root = format_args!("{root:#x}"),
        kernel_end = format_args!("{kernel_end:#x}"),
        "boot environment written"
    );
    Ok(BootInfo {
        kernel_end,
        page_tables: root,
    })
}

/// Build the page tables and return the root.
pub fn setup_page_tables<P: PageTableMemory>(
    pt: &mut P,
    setup: &BootSetup<'_>,
) -> Result<u64, BootError> {
    use layout::*;

    let heap_start = page_align_up(setup.binary_end);
    if heap_start > setup.max_mem {
        return Err(BootError::MemoryTooSmall {
            max_mem: setup.max_mem,
            binary_end: setup.binary_end,
        });
    }

    let root = pt.allocate_page()?;
    let low = |writable, executable| PagePermissions::supervisor(writable, executable);

    // descriptor tables, trampolines, exit stub, SMP TSS, interrupt stacks
    map_range(pt, root, 0x1000, 0x1000, PAGE_SIZE, low(false, false), false)?;
    map_range(pt, root, INTR_ASM_ADDR, INTR_ASM_ADDR, PAGE_SIZE, low(false, true), false)?;
    map_range(
        pt,
        root,
        USER_ASM_ADDR,
        USER_ASM_ADDR,
        PAGE_SIZE,
        PagePermissions::user(false, true),
        false,
    )?;
    map_range(pt, root, TSS_SMP_ADDR, TSS_SMP_ADDR, PAGE_SIZE, low(false, false), false)?;
    map_range(pt, root, IST_ADDR, IST_ADDR, PAGE_SIZE, low(true, false), false)?;
    map_range(
        pt,
        root,
        IST_SMP_ADDR,
        IST_SMP_ADDR,
        PT_ADDR - IST_SMP_ADDR,
        low(true, false),
        false,
    )?;

    for seg in setup.segments {
        let start = page_align_down(seg.vaddr);
        let end = page_align_up(seg.vaddr + seg.size);
        if start < BINARY_BASE || end > setup.max_mem {
            return Err(BootError::SegmentOutOfRange {
                vaddr: seg.vaddr,
                size: seg.size,
                max_mem: setup.max_mem,
            });
        }
        map_range(pt, root, start, start, end - start, seg.perms, false)?;
    }

    if heap_start < setup.max_mem {
        map_range(
            pt,
            root,
            heap_start,
            heap_start,
            page_align_down(setup.max_mem) - heap_start,
            PagePermissions::user(true, false),
            !setup.split_hugepages,
        )?;
    }

    map_range(
        pt,
        root,
        VSYSCALL_VIRT,
        VSYSCALL_PHYS,
        PAGE_SIZE,
        PagePermissions::user(false, true),
        false,
    )?;

    for remap in setup.remappings {
        let perms = PagePermissions::user(remap.writable, remap.executable);
        map_range(
            pt,
            root,
            remap.virt,
            remap.phys,
            page_align_up(remap.size),
            perms,
            !setup.split_hugepages,
        )?;
    }

    Ok(root)
}

/// CR0 bits.
pub mod cr0 {
    pub const PE: u64 = 1 << 0;
    pub const MP: u64 = 1 << 1;
    pub const ET: u64 = 1 << 4;
    pub const NE: u64 = 1 << 5;
    pub const WP: u64 = 1 << 16;
    pub const AM: u64 = 1 << 18;
    pub const PG: u64 = 1 << 31;
}

/// CR4 bits.
pub mod cr4 {
    pub const PAE: u64 = 1 << 5;
    pub const PGE: u64 = 1 << 7;
    pub const OSFXSR: u64 = 1 << 9;
    pub const OSXMMEXCPT: u64 = 1 << 10;
    pub const FSGSBASE: u64 = 1 << 16;
    pub const OSXSAVE: u64 = 1 << 18;
    pub const SMEP: u64 = 1 << 20;
    pub const SMAP: u64 = 1 << 21;
}

/// EFER bits.
pub mod efer {
    pub const SCE: u64 = 1 << 0;
    pub const LME: u64 = 1 << 8;
    pub const LMA: u64 = 1 << 10;
    pub const NXE: u64 = 1 << 11;
}

/// Special registers for ring-3 long mode, starting from `base`.
///
/// Segment registers come out as user selectors (CS 0x2b, others 0x23). The
/// vCPU still enters at ring 3 directly; there is no ring-0 boot phase.
/// GS points at the primary's entry in the per-vCPU table.
pub fn long_mode_sregs(base: &kvm_sregs, features: &HostFeatures, page_tables: u64) -> kvm_sregs {
    let mut sregs = *base;

    let code = gdt::user_code_segment();
    let data = gdt::user_data_segment();
    sregs.cs = code;
    sregs.ds = data;
    sregs.es = data;
    sregs.fs = data;
    sregs.gs = data;
    sregs.gs.base = trampoline::vcpu_table_address(0);
    sregs.ss = data;
    sregs.tr = tss::tss_segment(layout::TSS_ADDR);

    sregs.gdt = kvm_dtable {
        base: layout::GDT_ADDR,
        limit: gdt::GDT_LIMIT,
        ..Default::default()
    };
    sregs.idt = idt::idt_register();

    sregs.cr0 = cr0::PE | cr0::MP | cr0::ET | cr0::NE | cr0::WP | cr0::AM | cr0::PG;
    sregs.cr3 = page_tables;
    sregs.cr4 = features.cr4();
    sregs.efer = efer::SCE | efer::LME | efer::LMA | efer::NXE;
    sregs
}

#[cfg(test)]
mod tests {
    use super::paging::{translate, PDE64_NX};
    use super::*;
    use vm_memory::GuestAddress;

    fn memory() -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 8 << 20)]).unwrap()
    }

    fn text_segment() -> SegmentMapping {
        SegmentMapping {
            vaddr: 0x10_0000,
            size: 0x1800,
            perms: PagePermissions::user(false, true),
        }
    }

    fn boot(mem: &GuestMemoryMmap, split: bool) -> BootInfo {
        let segments = [text_segment()];
        let setup = BootSetup {
            segments: &segments,
            binary_end: 0x10_1800,
            max_mem: 8 << 20,
            remappings: &[],
            split_hugepages: split,
        };
        setup_long_mode(mem, &mut PageArena::boot(), &setup).unwrap()
    }

    #[test]
    fn test_root_is_first_arena_page() {
        let mem = memory();
        let info = boot(&mem, false);
        assert_eq!(info.page_tables, layout::PT_ADDR);
        assert!(info.kernel_end > layout::PT_ADDR);
        assert!(info.kernel_end <= layout::PT_ARENA_END);
    }

    #[test]
    fn test_low_memory_is_supervisor_only() {
        let mem = memory();
        let info = boot(&mem, false);
        let root = info.page_tables;
        assert!(translate(&mem, root, 0).unwrap().is_none());
        for addr in [0x1000, layout::INTR_ASM_ADDR, layout::IST_ADDR, 0x9000] {
            let t = translate(&mem, root, addr).unwrap().unwrap();
            assert!(!t.user, "{addr:#x} reachable from ring 3");
        }
        let tables = translate(&mem, root, 0x1000).unwrap().unwrap();
        assert!(!tables.writable && !tables.executable);
        let blob = translate(&mem, root, layout::INTR_ASM_ADDR).unwrap().unwrap();
        assert!(blob.executable && !blob.writable);
        // page tables themselves are not mapped at all
        assert!(translate(&mem, root, layout::PT_ADDR).unwrap().is_none());
    }

    #[test]
    fn test_exit_stub_is_user_executable() {
        let mem = memory();
        let info = boot(&mem, false);
        let t = translate(&mem, info.page_tables, layout::USER_ASM_ADDR)
            .unwrap()
            .unwrap();
        assert!(t.user && t.executable && !t.writable);
    }

    #[test]
    fn test_segments_and_heap() {
        let mem = memory();
        let info = boot(&mem, false);
        let root = info.page_tables;
        let text = translate(&mem, root, 0x10_1000).unwrap().unwrap();
        assert!(text.user && text.executable && !text.writable);

        let heap = translate(&mem, root, 0x10_2000).unwrap().unwrap();
        assert!(heap.user && heap.writable && !heap.executable);
        assert_eq!(heap.page_size, layout::PAGE_SIZE);

        let huge = translate(&mem, root, 0x40_0000).unwrap().unwrap();
        assert_eq!(huge.page_size, layout::HUGE_PAGE_SIZE);
        assert!(translate(&mem, root, 8 << 20).unwrap().is_none());
    }

    #[test]
    fn test_split_hugepages() {
        let mem = memory();
        let info = boot(&mem, true);
        let t = translate(&mem, info.page_tables, 0x40_0000).unwrap().unwrap();
        assert_eq!(t.page_size, layout::PAGE_SIZE);
    }

    #[test]
    fn test_vsyscall_mapping() {
        let mem = memory();
        let info = boot(&mem, false);
        let t = translate(&mem, info.page_tables, layout::VSYSCALL_VIRT + 0x400)
            .unwrap()
            .unwrap();
        assert_eq!(t.phys, layout::VSYSCALL_PHYS + 0x400);
        assert!(t.user && t.executable);
    }

    #[test]
    fn test_remapping() {
        let mem = memory();
        let segments = [text_segment()];
        let remaps = [VirtualRemapping {
            phys: 0x60_0000,
            virt: 0x7f00_0000_0000,
            size: 0x3000,
            writable: true,
            executable: false,
        }];
        let setup = BootSetup {
            segments: &segments,
            binary_end: 0x10_1800,
            max_mem: 8 << 20,
            remappings: &remaps,
            split_hugepages: false,
        };
        let info = setup_long_mode(&mem, &mut PageArena::boot(), &setup).unwrap();
        let t = translate(&mem, info.page_tables, 0x7f00_0000_2010).unwrap().unwrap();
        assert_eq!(t.phys, 0x60_2010);
        assert!(t.writable);
    }

    #[test]
    fn test_segment_outside_memory_rejected() {
        let mem = memory();
        let segments = [SegmentMapping {
            vaddr: 0x7f_0000,
            size: 0x20_0000,
            perms: PagePermissions::user(true, false),
        }];
        let setup = BootSetup {
            segments: &segments,
            binary_end: 0x10_0000,
            max_mem: 8 << 20,
            remappings: &[],
            split_hugepages: false,
        };
        let err = setup_long_mode(&mem, &mut PageArena::boot(), &setup);
        assert!(matches!(err, Err(BootError::SegmentOutOfRange { .. })));
    }

    #[test]
    fn test_nx_on_low_data_pages() {
        let mem = memory();
        let info = boot(&mem, false);
        let pml4: u64 = vm_memory::Bytes::read_obj(&mem, GuestAddress(info.page_tables)).unwrap();
        // intermediate entries never carry NX
        assert_eq!(pml4 & PDE64_NX, 0);
    }

    #[test]
    fn test_long_mode_sregs() {
        let features = HostFeatures::default();
        let sregs = long_mode_sregs(&kvm_sregs::default(), &features, layout::PT_ADDR);
        assert_eq!(sregs.cs.selector, 0x2b);
        assert_eq!(sregs.ss.selector, 0x23);
        assert_eq!(sregs.cs.l, 1);
        assert_eq!(sregs.tr.base, layout::TSS_ADDR);
        assert_eq!(sregs.gs.base, trampoline::VCPU_TABLE_ADDR);
        assert_eq!(sregs.fs.base, 0);
        assert_eq!(sregs.gdt.base, layout::GDT_ADDR);
        assert_eq!(sregs.gdt.limit, 63);
        assert_eq!(sregs.idt.base, layout::IDT_ADDR);
        assert_eq!(sregs.cr3, layout::PT_ADDR);
        assert_ne!(sregs.cr0 & cr0::PG, 0);
        assert_ne!(sregs.cr0 & cr0::WP, 0);
        assert_ne!(sregs.cr4 & cr4::PAE, 0);
        assert_eq!(sregs.cr4 & cr4::SMEP, 0);
        assert_eq!(
            sregs.efer,
            efer::SCE | efer::LME | efer::LMA | efer::NXE
        );
    }

    #[test]
    fn test_page_alignment_helpers() {
        assert_eq!(page_align_down(0x1fff), 0x1000);
        assert_eq!(page_align_up(0x1001), 0x2000);
        assert_eq!(page_align_up(0x2000), 0x2000);
    }
}
