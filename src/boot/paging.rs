//! 4-level page tables: boot-time mapping, software walks and the
//! copy-on-write surgery used by forked machines.
//!
//! # Page Table Structure
//!
//! ```text
//! CR3 → PML4 → PDPT → PD → PT → 4KB page
//!       512GB   1GB   2MB   4KB   per entry
//! ```
//!
//! A PD entry with the PS bit set maps a 2MB page directly. Heap memory is
//! mapped with 2MB pages whenever virtual and physical addresses line up,
//! everything else uses 4KB pages.
//!
//! Page tables are addressed by guest physical address and reached through
//! [`PageTableMemory`], which also decides where new table pages come from:
//! the low-memory arena during boot, or memory banks once a machine runs
//! copy-on-write.
//!
//! # Copy-on-write
//!
//! [`foreach_page_makecow`] turns every writable leaf inside a range into a
//! read-only leaf tagged with the software-available [`PDE64_CLONEABLE`] bit.
//! A write then faults and [`cow_fault`] walks from the machine's private
//! root: intermediate tables that are still shared get cloned, a 2MB leaf is
//! split into 4KB leaves, and finally the 4KB page is copied and made
//! writable. Only the path to the faulting page is duplicated.
//!
//! Accessed and dirty bits are preset on every entry so the CPU never writes
//! back into tables that are shared between machines.

use super::layout::{self, HUGE_PAGE_SIZE, PAGE_SIZE};
use crate::memory::MemoryError;
use std::fmt::Write;
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemoryError, GuestMemoryMmap};

pub const PDE64_PRESENT: u64 = 1 << 0;
pub const PDE64_RW: u64 = 1 << 1;
pub const PDE64_USER: u64 = 1 << 2;
pub const PDE64_ACCESSED: u64 = 1 << 5;
pub const PDE64_DIRTY: u64 = 1 << 6;
/// Page size bit: the entry maps a 2MB (PD) or 1GB (PDPT) page.
pub const PDE64_PS: u64 = 1 << 7;
/// Software bit 11: read-only now, but may be copied on write.
pub const PDE64_CLONEABLE: u64 = 1 << 11;
pub const PDE64_NX: u64 = 1 << 63;
pub const PDE64_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Flags of non-leaf entries. Leaves carry the effective permissions.
const TABLE_FLAGS: u64 = PDE64_PRESENT | PDE64_RW | PDE64_USER | PDE64_ACCESSED;

const ENTRIES: u64 = 512;
const PML4_SHIFT: u32 = 39;

/// Errors from page-table operations.
#[derive(Error, Debug)]
pub enum PagingError {
    #[error("Page table arena exhausted at {0:#x}")]
    ArenaExhausted(u64),

    #[error("Address {0:#x} is not mapped")]
    NotPresent(u64),

    #[error("Address {0:#x} is read-only")]
    ReadOnly(u64),

    #[error("Address {virt:#x} is already mapped to {existing:#x}")]
    MappingConflict { virt: u64, existing: u64 },

    #[error("Misaligned mapping {virt:#x} -> {phys:#x} ({size:#x} bytes)")]
    Misaligned { virt: u64, phys: u64, size: u64 },

    #[error("Guest memory access failed: {0}")]
    Access(#[from] GuestMemoryError),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Effective permissions of a leaf mapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PagePermissions {
    pub writable: bool,
    pub executable: bool,
    pub user: bool,
}

impl PagePermissions {
    pub const fn user(writable: bool, executable: bool) -> Self {
        Self {
            writable,
            executable,
            user: true,
        }
    }

    pub const fn supervisor(writable: bool, executable: bool) -> Self {
        Self {
            writable,
            executable,
            user: false,
        }
    }

    fn leaf_bits(self) -> u64 {
        let mut bits = PDE64_PRESENT | PDE64_ACCESSED | PDE64_DIRTY;
        if self.writable {
            bits |= PDE64_RW;
        }
        if self.user {
            bits |= PDE64_USER;
        }
        if !self.executable {
            bits |= PDE64_NX;
        }
        bits
    }
}

/// Maps `size` bytes at guest virtual `virt` onto guest physical `phys`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirtualRemapping {
    pub phys: u64,
    pub virt: u64,
    pub size: u64,
    pub writable: bool,
    pub executable: bool,
}

/// Result of a software page walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    pub phys: u64,
    pub page_size: u64,
    pub writable: bool,
    pub user: bool,
    pub executable: bool,
    pub cloneable: bool,
}

/// Outcome of resolving a write fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CowOutcome {
    /// Physical base of the (now writable) 4KB page.
    pub phys: u64,
    /// A private copy was materialized.
    pub copied: bool,
}

/// Backing store for page-table pages.
pub trait PageTableMemory {
    fn memory(&self) -> &GuestMemoryMmap;

    /// Hand out a zeroed page and return its guest physical address.
    fn allocate_page(&mut self) -> Result<u64, PagingError>;

    /// Whether the page at `addr` may be modified in place.
    fn owns(&self, addr: u64) -> bool;

    fn read_entry(&self, addr: u64) -> Result<u64, PagingError> {
        Ok(self.memory().read_obj(GuestAddress(addr))?)
    }

    fn write_entry(&self, addr: u64, value: u64) -> Result<(), PagingError> {
        Ok(self.memory().write_obj(value, GuestAddress(addr))?)
    }

    fn copy_page(&self, dst: u64, src: u64) -> Result<(), PagingError> {
        let mut buf = [0u8; PAGE_SIZE as usize];
        self.memory().read_slice(&mut buf, GuestAddress(src))?;
        self.memory().write_slice(&buf, GuestAddress(dst))?;
        Ok(())
    }
}

/// Bump allocator over the fixed low-memory page-table area.
#[derive(Debug, Clone)]
pub struct PageArena {
    next: u64,
    end: u64,
}

impl PageArena {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { next: start, end }
    }

    /// The boot arena, starting with the main PML4.
    pub const fn boot() -> Self {
        Self::new(layout::PT_ADDR, layout::PT_ARENA_END)
    }

    pub fn next(&self) -> u64 {
        self.next
    }
}

/// Page tables living in main memory, mutated in place.
pub struct ArenaPages<'a> {
    memory: &'a GuestMemoryMmap,
    arena: &'a mut PageArena,
}

impl<'a> ArenaPages<'a> {
    pub fn new(memory: &'a GuestMemoryMmap, arena: &'a mut PageArena) -> Self {
        Self { memory, arena }
    }
}

impl PageTableMemory for ArenaPages<'_> {
    fn memory(&self) -> &GuestMemoryMmap {
        self.memory
    }

    fn allocate_page(&mut self) -> Result<u64, PagingError> {
        let addr = self.arena.next;
        if addr + PAGE_SIZE > self.arena.end {
            return Err(PagingError::ArenaExhausted(addr));
        }
        self.memory
            .write_slice(&[0u8; PAGE_SIZE as usize], GuestAddress(addr))?;
        self.arena.next += PAGE_SIZE;
        Ok(addr)
    }

    fn owns(&self, _addr: u64) -> bool {
        true
    }
}

#[inline]
fn entry_addr(table: u64, vaddr: u64, shift: u32) -> u64 {
    table + ((vaddr >> shift) & (ENTRIES - 1)) * 8
}

#[inline]
fn is_leaf(entry: u64, shift: u32) -> bool {
    shift == 12 || entry & PDE64_PS != 0
}

/// Sign-extend bit 47 for addresses built from PML4 indices.
#[inline]
fn canonical(addr: u64) -> u64 {
    if addr & (1 << 47) != 0 {
        addr | 0xffff_0000_0000_0000
    } else {
        addr
    }
}

fn merge_leaf(old: u64, new: u64) -> u64 {
    let nx = old & new & PDE64_NX;
    ((old | new) & !PDE64_NX) | nx
}

/// Map one 4KB or 2MB page.
pub fn map_page<P: PageTableMemory + ?Sized>(
    pt: &mut P,
    root: u64,
    virt: u64,
    phys: u64,
    huge: bool,
    perms: PagePermissions,
) -> Result<(), PagingError> {
    let leaf_shift = if huge { 21 } else { 12 };
    let mut table = root;
    let mut shift = PML4_SHIFT;
    loop {
        let ea = entry_addr(table, virt, shift);
        let entry = pt.read_entry(ea)?;
        if shift == leaf_shift {
            let bits = perms.leaf_bits() | if huge { PDE64_PS } else { 0 };
            if entry & PDE64_PRESENT != 0 {
                if entry & PDE64_ADDR_MASK != phys {
                    return Err(PagingError::MappingConflict {
                        virt,
                        existing: entry & PDE64_ADDR_MASK,
                    });
                }
                return pt.write_entry(ea, merge_leaf(entry, phys | bits));
            }
            return pt.write_entry(ea, phys | bits);
        }
        if entry & PDE64_PRESENT == 0 {
            let next = pt.allocate_page()?;
            pt.write_entry(ea, next | TABLE_FLAGS)?;
            table = next;
        } else if entry & PDE64_PS != 0 {
            return Err(PagingError::MappingConflict {
                virt,
                existing: entry & PDE64_ADDR_MASK,
            });
        } else {
            table = entry & PDE64_ADDR_MASK;
        }
        shift -= 9;
    }
}

/// Map a page-aligned range, using 2MB pages where both sides allow it.
pub fn map_range<P: PageTableMemory + ?Sized>(
    pt: &mut P,
    root: u64,
    virt: u64,
    phys: u64,
    size: u64,
    perms: PagePermissions,
    allow_huge: bool,
) -> Result<(), PagingError> {
    if virt % PAGE_SIZE != 0 || phys % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
        return Err(PagingError::Misaligned { virt, phys, size });
    }
    let mut offset = 0;
    while offset < size {
        let (v, p) = (virt + offset, phys + offset);
        let huge = allow_huge
            && v % HUGE_PAGE_SIZE == 0
            && p % HUGE_PAGE_SIZE == 0
            && size - offset >= HUGE_PAGE_SIZE;
        map_page(pt, root, v, p, huge, perms)?;
        offset += if huge { HUGE_PAGE_SIZE } else { PAGE_SIZE };
    }
    Ok(())
}

/// Find the leaf entry mapping `vaddr`, with its level shift.
fn walk(memory: &GuestMemoryMmap, root: u64, vaddr: u64) -> Result<Option<(u64, u32)>, PagingError> {
    let mut table = root;
    let mut shift = PML4_SHIFT;
    loop {
        let entry: u64 = memory.read_obj(GuestAddress(entry_addr(table, vaddr, shift)))?;
        if entry & PDE64_PRESENT == 0 {
            return Ok(None);
        }
        if is_leaf(entry, shift) {
            return Ok(Some((entry, shift)));
        }
        table = entry & PDE64_ADDR_MASK;
        shift -= 9;
    }
}

/// Translate a guest virtual address by walking the tables in software.
pub fn translate(
    memory: &GuestMemoryMmap,
    root: u64,
    vaddr: u64,
) -> Result<Option<Translation>, PagingError> {
    Ok(walk(memory, root, vaddr)?.map(|(entry, shift)| {
        let page_size = 1u64 << shift;
        Translation {
            phys: (entry & PDE64_ADDR_MASK & !(page_size - 1)) + (vaddr & (page_size - 1)),
            page_size,
            writable: entry & PDE64_RW != 0,
            user: entry & PDE64_USER != 0,
            executable: entry & PDE64_NX == 0,
            cloneable: entry & PDE64_CLONEABLE != 0,
        }
    }))
}

/// Replace a large leaf by a table of leaves one level down, keeping flags.
fn split_leaf<P: PageTableMemory + ?Sized>(
    pt: &mut P,
    ea: u64,
    entry: u64,
    shift: u32,
) -> Result<u64, PagingError> {
    let child_shift = shift - 9;
    let child_size = 1u64 << child_shift;
    let base = entry & PDE64_ADDR_MASK & !((1u64 << shift) - 1);
    let mut flags = entry & !PDE64_ADDR_MASK;
    if child_shift == 12 {
        flags &= !PDE64_PS;
    }
    let table = pt.allocate_page()?;
    for i in 0..ENTRIES {
        pt.write_entry(table + i * 8, (base + i * child_size) | flags)?;
    }
    pt.write_entry(ea, table | TABLE_FLAGS)?;
    Ok(table)
}

/// Write-protect every writable leaf overlapping `[begin, end)` and tag it
/// cloneable. Large pages straddling a bound are split first. Returns the
/// number of leaves changed.
pub fn foreach_page_makecow<P: PageTableMemory + ?Sized>(
    pt: &mut P,
    root: u64,
    begin: u64,
    end: u64,
) -> Result<usize, PagingError> {
    makecow_table(pt, root, PML4_SHIFT, 0, begin, end)
}

fn makecow_table<P: PageTableMemory + ?Sized>(
    pt: &mut P,
    table: u64,
    shift: u32,
    base: u64,
    begin: u64,
    end: u64,
) -> Result<usize, PagingError> {
    let span = 1u64 << shift;
    let mut changed = 0;
    for i in 0..ENTRIES {
        let virt = canonical(base.wrapping_add(i << shift));
        let last = virt.wrapping_add(span - 1);
        if last < begin || virt >= end {
            continue;
        }
        let ea = table + i * 8;
        let entry = pt.read_entry(ea)?;
        if entry & PDE64_PRESENT == 0 {
            continue;
        }
        if !is_leaf(entry, shift) {
            changed += makecow_table(pt, entry & PDE64_ADDR_MASK, shift - 9, virt, begin, end)?;
            continue;
        }
        if entry & PDE64_RW == 0 {
            continue;
        }
        if virt >= begin && last < end {
            pt.write_entry(ea, (entry & !PDE64_RW) | PDE64_CLONEABLE)?;
            changed += 1;
        } else {
            let child = split_leaf(pt, ea, entry, shift)?;
            changed += makecow_table(pt, child, shift - 9, virt, begin, end)?;
        }
    }
    Ok(changed)
}

/// Resolve a write to `vaddr` under the private root `root`.
///
/// With `force`, a page that is already writable but still shared (an
/// interrupt stack, for instance) is copied as well.
pub fn cow_fault<P: PageTableMemory + ?Sized>(
    pt: &mut P,
    root: u64,
    vaddr: u64,
    force: bool,
) -> Result<CowOutcome, PagingError> {
    let mut table = root;
    let mut shift = PML4_SHIFT;
    loop {
        let ea = entry_addr(table, vaddr, shift);
        let entry = pt.read_entry(ea)?;
        if entry & PDE64_PRESENT == 0 {
            return Err(PagingError::NotPresent(vaddr));
        }

        if !is_leaf(entry, shift) {
            let child = entry & PDE64_ADDR_MASK;
            table = if pt.owns(child) {
                child
            } else {
                let copy = pt.allocate_page()?;
                pt.copy_page(copy, child)?;
                pt.write_entry(ea, copy | (entry & !PDE64_ADDR_MASK))?;
                copy
            };
            shift -= 9;
            continue;
        }

        let page_size = 1u64 << shift;
        let phys = entry & PDE64_ADDR_MASK & !(page_size - 1);
        let writable = entry & PDE64_RW != 0;
        if writable && (!force || pt.owns(phys)) {
            return Ok(CowOutcome {
                phys,
                copied: false,
            });
        }
        if !writable && entry & PDE64_CLONEABLE == 0 {
            return Err(PagingError::ReadOnly(vaddr));
        }
        if shift != 12 {
            table = split_leaf(pt, ea, entry, shift)?;
            shift -= 9;
            continue;
        }

        let flags = (entry & !PDE64_ADDR_MASK & !PDE64_CLONEABLE) | PDE64_RW;
        if pt.owns(phys) {
            pt.write_entry(ea, phys | flags)?;
            return Ok(CowOutcome {
                phys,
                copied: false,
            });
        }
        let page = pt.allocate_page()?;
        pt.copy_page(page, phys)?;
        pt.write_entry(ea, page | flags)?;
        return Ok(CowOutcome {
            phys: page,
            copied: true,
        });
    }
}

/// Copy a whole page-table page.
pub fn page_duplicate<P: PageTableMemory + ?Sized>(
    pt: &P,
    dst: u64,
    src: u64,
) -> Result<(), PagingError> {
    pt.copy_page(dst, src)
}

fn describe(entry: u64) -> String {
    let mut flags = String::with_capacity(8);
    flags.push(if entry & PDE64_RW != 0 { 'W' } else { 'R' });
    flags.push(if entry & PDE64_USER != 0 { 'U' } else { 'S' });
    flags.push(if entry & PDE64_NX != 0 { '-' } else { 'X' });
    if entry & PDE64_CLONEABLE != 0 {
        flags.push('C');
    }
    flags
}

/// Human-readable list of every leaf reachable from `root`.
pub fn print_pagetables(memory: &GuestMemoryMmap, root: u64) -> Result<String, PagingError> {
    let mut out = String::new();
    let _ = writeln!(out, "PML4 at {root:#x}");
    print_table(memory, root, PML4_SHIFT, 0, &mut out)?;
    Ok(out)
}

fn print_table(
    memory: &GuestMemoryMmap,
    table: u64,
    shift: u32,
    base: u64,
    out: &mut String,
) -> Result<(), PagingError> {
    for i in 0..ENTRIES {
        let entry: u64 = memory.read_obj(GuestAddress(table + i * 8))?;
        if entry & PDE64_PRESENT == 0 {
            continue;
        }
        let virt = canonical(base.wrapping_add(i << shift));
        if is_leaf(entry, shift) {
            let size = match shift {
                12 => "4K",
                21 => "2M",
                _ => "1G",
            };
            let _ = writeln!(
                out,
                "  {virt:#018x} -> {:#012x} {size} {}",
                entry & PDE64_ADDR_MASK & !((1u64 << shift) - 1),
                describe(entry)
            );
        } else {
            print_table(memory, entry & PDE64_ADDR_MASK, shift - 9, virt, out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_memory::GuestAddress;

    const MEM_SIZE: usize = 16 << 20;
    /// Pages at or above this address play the role of private bank pages.
    const OWNED_FROM: u64 = 12 << 20;

    struct TestPages {
        memory: GuestMemoryMmap,
        next: u64,
        owned_from: u64,
    }

    impl TestPages {
        fn new() -> Self {
            let memory = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), MEM_SIZE)]).unwrap();
            Self {
                memory,
                next: layout::PT_ADDR,
                owned_from: 0,
            }
        }

        /// Switch to "fork" mode: everything allocated from now on is private.
        fn fork(&mut self) {
            self.next = OWNED_FROM;
            self.owned_from = OWNED_FROM;
        }
    }

    impl PageTableMemory for TestPages {
        fn memory(&self) -> &GuestMemoryMmap {
            &self.memory
        }

        fn allocate_page(&mut self) -> Result<u64, PagingError> {
            let addr = self.next;
            self.memory
                .write_slice(&[0u8; PAGE_SIZE as usize], GuestAddress(addr))?;
            self.next += PAGE_SIZE;
            Ok(addr)
        }

        fn owns(&self, addr: u64) -> bool {
            addr >= self.owned_from
        }
    }

    fn user_rw() -> PagePermissions {
        PagePermissions::user(true, false)
    }

    fn setup() -> (TestPages, u64) {
        let mut pt = TestPages::new();
        let root = pt.allocate_page().unwrap();
        // 4K pages in the first 2MB, one 2MB page at 4MB
        map_range(&mut pt, root, 0x10_0000, 0x10_0000, 0x10_0000, user_rw(), true).unwrap();
        map_range(&mut pt, root, 0x40_0000, 0x40_0000, 0x20_0000, user_rw(), true).unwrap();
        (pt, root)
    }

    #[test]
    fn test_identity_translation() {
        let (pt, root) = setup();
        let t = translate(&pt.memory, root, 0x10_0123).unwrap().unwrap();
        assert_eq!(t.phys, 0x10_0123);
        assert_eq!(t.page_size, PAGE_SIZE);
        assert!(t.writable && t.user && !t.executable);

        let t = translate(&pt.memory, root, 0x45_6789).unwrap().unwrap();
        assert_eq!(t.phys, 0x45_6789);
        assert_eq!(t.page_size, HUGE_PAGE_SIZE);

        assert!(translate(&pt.memory, root, 0x30_0000).unwrap().is_none());
    }

    #[test]
    fn test_remapped_translation() {
        let mut pt = TestPages::new();
        let root = pt.allocate_page().unwrap();
        let perms = PagePermissions::user(false, true);
        map_range(&mut pt, root, 0x7000_0000_0000, 0x20_0000, 0x2000, perms, true).unwrap();
        let t = translate(&pt.memory, root, 0x7000_0000_1004).unwrap().unwrap();
        assert_eq!(t.phys, 0x20_1004);
        assert!(t.executable && !t.writable);
    }

    #[test]
    fn test_overlapping_segments_merge_permissions() {
        let mut pt = TestPages::new();
        let root = pt.allocate_page().unwrap();
        map_page(&mut pt, root, 0x10_0000, 0x10_0000, false, PagePermissions::user(false, true)).unwrap();
        map_page(&mut pt, root, 0x10_0000, 0x10_0000, false, user_rw()).unwrap();
        let t = translate(&pt.memory, root, 0x10_0000).unwrap().unwrap();
        assert!(t.writable && t.executable);
    }

    #[test]
    fn test_conflicting_mapping_rejected() {
        let mut pt = TestPages::new();
        let root = pt.allocate_page().unwrap();
        map_page(&mut pt, root, 0x10_0000, 0x10_0000, false, user_rw()).unwrap();
        let err = map_page(&mut pt, root, 0x10_0000, 0x20_0000, false, user_rw());
        assert!(matches!(err, Err(PagingError::MappingConflict { .. })));
    }

    #[test]
    fn test_misaligned_range_rejected() {
        let mut pt = TestPages::new();
        let root = pt.allocate_page().unwrap();
        let err = map_range(&mut pt, root, 0x10_0010, 0x10_0000, 0x1000, user_rw(), false);
        assert!(matches!(err, Err(PagingError::Misaligned { .. })));
    }

    #[test]
    fn test_makecow_respects_bounds() {
        let (mut pt, root) = setup();
        let changed = foreach_page_makecow(&mut pt, root, 0x18_0000, 0x50_0000).unwrap();
        // 0x180000..0x200000 are 128 4K pages, the 2MB page straddles 0x500000
        // and is split into 256 4K pages below the bound
        assert_eq!(changed, 128 + 256);

        let below = translate(&pt.memory, root, 0x17_f000).unwrap().unwrap();
        assert!(below.writable && !below.cloneable);
        let inside = translate(&pt.memory, root, 0x18_0000).unwrap().unwrap();
        assert!(!inside.writable && inside.cloneable);
        let split = translate(&pt.memory, root, 0x4f_f000).unwrap().unwrap();
        assert_eq!(split.page_size, PAGE_SIZE);
        assert!(!split.writable && split.cloneable);
        let above = translate(&pt.memory, root, 0x50_0000).unwrap().unwrap();
        assert!(above.writable && !above.cloneable);
    }

    #[test]
    fn test_makecow_keeps_whole_hugepage() {
        let (mut pt, root) = setup();
        foreach_page_makecow(&mut pt, root, 0x10_0000, u64::MAX).unwrap();
        let t = translate(&pt.memory, root, 0x40_0000).unwrap().unwrap();
        assert_eq!(t.page_size, HUGE_PAGE_SIZE);
        assert!(t.cloneable && !t.writable);
    }

    #[test]
    fn test_makecow_skips_read_only_pages() {
        let mut pt = TestPages::new();
        let root = pt.allocate_page().unwrap();
        map_page(&mut pt, root, 0x10_0000, 0x10_0000, false, PagePermissions::user(false, true)).unwrap();
        assert_eq!(foreach_page_makecow(&mut pt, root, 0, u64::MAX).unwrap(), 0);
        let t = translate(&pt.memory, root, 0x10_0000).unwrap().unwrap();
        assert!(!t.cloneable);
    }

    fn fork_root(pt: &mut TestPages, master_root: u64) -> u64 {
        pt.fork();
        let root = pt.allocate_page().unwrap();
        page_duplicate(pt, root, master_root).unwrap();
        root
    }

    #[test]
    fn test_cow_fault_copies_once() {
        let (mut pt, master) = setup();
        foreach_page_makecow(&mut pt, master, 0x10_0000, u64::MAX).unwrap();
        pt.memory.write_obj(0xfeed_u64, GuestAddress(0x10_2000)).unwrap();
        let root = fork_root(&mut pt, master);

        let first = cow_fault(&mut pt, root, 0x10_2008, false).unwrap();
        assert!(first.copied);
        assert!(first.phys >= OWNED_FROM);
        // contents were copied
        let v: u64 = pt.memory.read_obj(GuestAddress(first.phys)).unwrap();
        assert_eq!(v, 0xfeed);

        let second = cow_fault(&mut pt, root, 0x10_2010, false).unwrap();
        assert!(!second.copied);
        assert_eq!(second.phys, first.phys);

        let t = translate(&pt.memory, root, 0x10_2000).unwrap().unwrap();
        assert_eq!(t.phys, first.phys);
        assert!(t.writable && !t.cloneable);
    }

    #[test]
    fn test_cow_fault_leaves_master_untouched() {
        let (mut pt, master) = setup();
        foreach_page_makecow(&mut pt, master, 0x10_0000, u64::MAX).unwrap();
        let root = fork_root(&mut pt, master);
        cow_fault(&mut pt, root, 0x10_3000, false).unwrap();

        let t = translate(&pt.memory, master, 0x10_3000).unwrap().unwrap();
        assert_eq!(t.phys, 0x10_3000);
        assert!(!t.writable && t.cloneable);
    }

    #[test]
    fn test_cow_fault_splits_hugepage() {
        let (mut pt, master) = setup();
        foreach_page_makecow(&mut pt, master, 0x10_0000, u64::MAX).unwrap();
        let root = fork_root(&mut pt, master);

        let out = cow_fault(&mut pt, root, 0x40_5000, false).unwrap();
        assert!(out.copied);
        let t = translate(&pt.memory, root, 0x40_5000).unwrap().unwrap();
        assert_eq!(t.page_size, PAGE_SIZE);
        assert!(t.writable);
        // neighbours still point at the shared page, read-only
        let n = translate(&pt.memory, root, 0x40_6000).unwrap().unwrap();
        assert_eq!(n.phys, 0x40_6000);
        assert!(!n.writable && n.cloneable);
        // master still sees one read-only 2MB page
        let m = translate(&pt.memory, master, 0x40_5000).unwrap().unwrap();
        assert_eq!(m.page_size, HUGE_PAGE_SIZE);
    }

    #[test]
    fn test_cow_fault_rejects_read_only() {
        let mut pt = TestPages::new();
        let master = pt.allocate_page().unwrap();
        map_page(&mut pt, master, 0x10_0000, 0x10_0000, false, PagePermissions::user(false, true)).unwrap();
        let root = fork_root(&mut pt, master);
        assert!(matches!(
            cow_fault(&mut pt, root, 0x10_0000, false),
            Err(PagingError::ReadOnly(0x10_0000))
        ));
        assert!(matches!(
            cow_fault(&mut pt, root, 0x90_0000, false),
            Err(PagingError::NotPresent(_))
        ));
    }

    #[test]
    fn test_forced_fault_privatizes_writable_page() {
        let mut pt = TestPages::new();
        let master = pt.allocate_page().unwrap();
        let stack = PagePermissions::supervisor(true, false);
        map_page(&mut pt, master, layout::IST_ADDR, layout::IST_ADDR, false, stack).unwrap();
        let root = fork_root(&mut pt, master);

        assert!(!cow_fault(&mut pt, root, layout::IST_ADDR, false).unwrap().copied);
        let forced = cow_fault(&mut pt, root, layout::IST_ADDR, true).unwrap();
        assert!(forced.copied);
        let t = translate(&pt.memory, root, layout::IST_ADDR).unwrap().unwrap();
        assert_eq!(t.phys, forced.phys);
        assert!(t.writable && !t.user);
        // forcing again is a no-op once the page is private
        assert!(!cow_fault(&mut pt, root, layout::IST_ADDR, true).unwrap().copied);
    }

    #[test]
    fn test_arena_exhaustion() {
        let memory = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 1 << 20)]).unwrap();
        let mut arena = PageArena::new(0x1000, 0x3000);
        let mut pages = ArenaPages::new(&memory, &mut arena);
        assert_eq!(pages.allocate_page().unwrap(), 0x1000);
        assert_eq!(pages.allocate_page().unwrap(), 0x2000);
        assert!(matches!(
            pages.allocate_page(),
            Err(PagingError::ArenaExhausted(0x3000))
        ));
    }

    #[test]
    fn test_canonical_addresses() {
        assert_eq!(canonical(511 << 39), 0xffff_ff80_0000_0000);
        assert_eq!(canonical(1 << 39), 1 << 39);
    }

    #[test]
    fn test_print_pagetables_lists_leaves() {
        let (pt, root) = setup();
        let dump = print_pagetables(&pt.memory, root).unwrap();
        assert!(dump.contains("0x0000000000400000 -> 0x0000400000 2M WU-"));
        assert!(dump.contains("0x0000000000100000 -> 0x0000100000 4K WU-"));
    }
}
