//! Guest memory of one machine: the main region, the shared vsyscall page,
//! the memory banks and the page tables that tie them together.
//!
//! # Regions
//!
//! ```text
//! slot 0   main memory    0x0 .. max_mem         shared with every fork
//! slot 1   vsyscall page  0xffff_a000            shared process-wide, read-only
//! slot 2+  memory banks   0x70_0000_0000 ..      private to one machine
//! ```
//!
//! All host-side accesses go through a `GuestMemoryMmap` view built from
//! those regions. The view is rebuilt whenever a bank is added or the banks
//! are reset.
//!
//! # Paging modes
//!
//! A freshly constructed machine edits its page tables in place
//! ([`PagingMode::Direct`]). Preparing it for copy-on-write either freezes it
//! ([`PagingMode::Flat`]) or gives it a private root page in a bank
//! ([`PagingMode::CopyOnWrite`]), which is also the mode every fork runs in.
//!
//! The page-table state sits behind a mutex. With a single vCPU the lock is
//! uncontended; with several vCPUs it serializes write faults that may race
//! on the same intermediate table.

pub mod banks;

pub use banks::{BankPage, MemoryBank, MemoryBanks, SlotRegistry, BANK_ARENA_BASE, BANK_PAGES};

use crate::boot::layout::{self, PAGE_SIZE};
use crate::boot::paging::{
    self, page_duplicate, CowOutcome, PageArena, PageTableMemory, PagingError, Translation,
};
use crate::boot::{self, idt, page_align_down, BootError, BootInfo, BootSetup};
use crate::kvm::KvmError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use vm_memory::{
    Bytes, GuestAddress, GuestMemoryError, GuestMemoryMmap, GuestMemoryRegion, GuestRegionMmap,
    MmapRegion,
};

/// Errors from guest memory management.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Failed to allocate {size:#x} bytes of guest memory: {reason}")]
    BankAllocation { size: u64, reason: String },

    #[error("Working memory exhausted after {max_pages} pages")]
    WorkMemoryExhausted { max_pages: u64 },

    #[error("Failed to install memory bank: {0}")]
    InstallSlot(#[source] KvmError),

    #[error("Failed to remove memory bank: {0}")]
    DeleteSlot(#[source] KvmError),

    #[error("Failed to update guest memory map: {0}")]
    Region(String),

    #[error("Guest memory access failed: {0}")]
    Access(#[from] GuestMemoryError),
}

/// A guest physical range as registered with KVM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub slot: u32,
    pub base: u64,
    pub size: u64,
    /// Host address backing the range, if any.
    pub host_addr: Option<u64>,
    pub readonly: bool,
}

impl MemoryRegion {
    /// A region without host backing is always read-only.
    pub fn new(slot: u32, base: u64, size: u64, host_addr: Option<u64>) -> Self {
        Self {
            slot,
            base,
            size,
            host_addr,
            readonly: host_addr.is_none(),
        }
    }

    pub fn read_only(mut self) -> Self {
        self.readonly = true;
        self
    }
}

/// Allocate an anonymous mapping placed at guest physical `base`.
pub(crate) fn allocate_region(base: u64, size: u64) -> Result<Arc<GuestRegionMmap>, MemoryError> {
    let fail = |reason: String| MemoryError::BankAllocation { size, reason };
    let mapping = MmapRegion::new(size as usize).map_err(|e| fail(e.to_string()))?;
    let region = GuestRegionMmap::new(mapping, GuestAddress(base)).map_err(|e| fail(e.to_string()))?;
    Ok(Arc::new(region))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// Page tables live in main memory and are edited in place.
    Direct,
    /// Prepared without working memory; write-protected pages stay read-only.
    Flat,
    /// Private root page in a bank; writes materialize private pages.
    CopyOnWrite,
}

struct PagedState {
    view: GuestMemoryMmap,
    banks: MemoryBanks,
    arena: PageArena,
    page_tables: u64,
    mode: PagingMode,
    cow_faults: u64,
    flush_pending: bool,
}

/// Page-table pages taken from memory banks.
struct BankPages<'a> {
    view: &'a mut GuestMemoryMmap,
    banks: &'a mut MemoryBanks,
    slots: &'a dyn SlotRegistry,
}

impl PageTableMemory for BankPages<'_> {
    fn memory(&self) -> &GuestMemoryMmap {
        self.view
    }

    fn allocate_page(&mut self) -> Result<u64, PagingError> {
        let before = self.banks.len();
        let page = self.banks.allocate_page(self.slots)?;
        if self.banks.len() != before {
            if let Some(bank) = self.banks.iter().last() {
                *self.view = self
                    .view
                    .insert_region(Arc::clone(bank.region()))
                    .map_err(|e| MemoryError::Region(e.to_string()))?;
            }
        }
        Ok(page.addr)
    }

    fn owns(&self, addr: u64) -> bool {
        self.banks.contains(addr)
    }
}

/// Guest memory and page tables of one machine.
pub struct MachineMemory {
    main: Arc<GuestRegionMmap>,
    vsyscall: Arc<GuestRegionMmap>,
    state: Mutex<PagedState>,
}

fn base_view(
    main: &Arc<GuestRegionMmap>,
    vsyscall: &Arc<GuestRegionMmap>,
) -> Result<GuestMemoryMmap, MemoryError> {
    GuestMemoryMmap::from_arc_regions(vec![Arc::clone(main), Arc::clone(vsyscall)])
        .map_err(|e| MemoryError::Region(e.to_string()))
}

impl MachineMemory {
    /// Allocate `max_mem` bytes of main memory.
    pub fn new(max_mem: u64, vsyscall: Arc<GuestRegionMmap>) -> Result<Self, MemoryError> {
        let main = allocate_region(0, max_mem)?;
        let view = base_view(&main, &vsyscall)?;
        Ok(Self {
            main,
            vsyscall,
            state: Mutex::new(PagedState {
                view,
                banks: MemoryBanks::new(),
                arena: PageArena::boot(),
                page_tables: layout::PT_ADDR,
                mode: PagingMode::Direct,
                cow_faults: 0,
                flush_pending: false,
            }),
        })
    }

    /// Share `master`'s main memory. Page tables are set up by
    /// [`enter_cow_mode`](Self::enter_cow_mode).
    pub fn fork_of(master: &MachineMemory) -> Result<Self, MemoryError> {
        let main = Arc::clone(&master.main);
        let vsyscall = Arc::clone(&master.vsyscall);
        let view = base_view(&main, &vsyscall)?;
        Ok(Self {
            main,
            vsyscall,
            state: Mutex::new(PagedState {
                view,
                banks: MemoryBanks::new(),
                arena: PageArena::new(0, 0),
                page_tables: layout::PT_ADDR,
                mode: PagingMode::CopyOnWrite,
                cow_faults: 0,
                flush_pending: false,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, PagedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_mem(&self) -> u64 {
        self.main.len()
    }

    pub fn main_region(&self) -> MemoryRegion {
        MemoryRegion::new(0, 0, self.main.len(), Some(self.main.as_ptr() as u64))
    }

    pub fn vsyscall_region(&self) -> MemoryRegion {
        MemoryRegion::new(
            1,
            layout::VSYSCALL_PHYS,
            self.vsyscall.len(),
            Some(self.vsyscall.as_ptr() as u64),
        )
        .read_only()
    }

    pub fn shares_main_with(&self, other: &MachineMemory) -> bool {
        Arc::ptr_eq(&self.main, &other.main)
    }

    /// Some fork still maps this main region.
    pub fn main_is_shared(&self) -> bool {
        Arc::strong_count(&self.main) > 1
    }

    /// Switch to `master`'s main memory. Banks must already be reset.
    pub fn rebind_main(&mut self, master: &MachineMemory) -> Result<(), MemoryError> {
        self.main = Arc::clone(&master.main);
        let view = base_view(&self.main, &self.vsyscall)?;
        let st = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(st.banks.is_empty());
        st.view = view;
        Ok(())
    }

    /// Write the boot environment and switch to direct paging.
    pub fn boot(&self, setup: &BootSetup<'_>) -> Result<BootInfo, BootError> {
        let mut guard = self.state();
        let st = &mut *guard;
        st.arena = PageArena::boot();
        let info = boot::setup_long_mode(&st.view, &mut st.arena, setup)?;
        st.page_tables = info.page_tables;
        st.mode = PagingMode::Direct;
        Ok(info)
    }

    /// Zero the whole main region.
    pub fn clear(&self) -> Result<(), MemoryError> {
        const CHUNK: usize = 64 * 1024;
        let zeroes = vec![0u8; CHUNK];
        let st = self.state();
        let size = self.main.len();
        let mut addr = 0;
        while addr < size {
            let len = CHUNK.min((size - addr) as usize);
            st.view.write_slice(&zeroes[..len], GuestAddress(addr))?;
            addr += len as u64;
        }
        Ok(())
    }

    pub fn write_phys(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        Ok(self.state().view.write_slice(data, GuestAddress(addr))?)
    }

    pub fn read_phys(&self, addr: u64, data: &mut [u8]) -> Result<(), MemoryError> {
        Ok(self.state().view.read_slice(data, GuestAddress(addr))?)
    }

    pub fn page_tables(&self) -> u64 {
        self.state().page_tables
    }

    pub fn mode(&self) -> PagingMode {
        self.state().mode
    }

    pub fn cow_faults(&self) -> u64 {
        self.state().cow_faults
    }

    pub fn has_banks(&self) -> bool {
        !self.state().banks.is_empty()
    }

    pub fn bank_count(&self) -> usize {
        self.state().banks.len()
    }

    /// Cap working memory. Zero means unlimited.
    pub fn set_max_pages(&self, max_pages: u64) {
        self.state().banks.set_max_pages(max_pages);
    }

    /// Write-protect `[begin, end)` in the main page tables.
    pub fn make_cow(&self, begin: u64, end: u64) -> Result<usize, PagingError> {
        let mut guard = self.state();
        let st = &mut *guard;
        let mut pages = paging::ArenaPages::new(&st.view, &mut st.arena);
        let changed = paging::foreach_page_makecow(&mut pages, layout::PT_ADDR, begin, end)?;
        tracing::debug!(
            begin = format_args!("{begin:#x}"),
            end = format_args!("{end:#x}"),
            changed,
            "write-protected guest pages"
        );
        Ok(changed)
    }

    /// Run from the main page tables without working memory.
    pub fn set_flat(&self) -> u64 {
        let mut st = self.state();
        st.mode = PagingMode::Flat;
        st.page_tables = layout::PT_ADDR;
        st.page_tables
    }

    /// Clone the main root into a private bank page and make each address in
    /// `force` privately writable. Returns the new root.
    pub fn enter_cow_mode(
        &self,
        slots: &dyn SlotRegistry,
        force: &[u64],
    ) -> Result<u64, PagingError> {
        let mut guard = self.state();
        let st = &mut *guard;
        let mut pages = BankPages {
            view: &mut st.view,
            banks: &mut st.banks,
            slots,
        };
        let root = pages.allocate_page()?;
        page_duplicate(&pages, root, layout::PT_ADDR)?;
        for &addr in force {
            paging::cow_fault(&mut pages, root, addr, true)?;
        }
        st.page_tables = root;
        st.mode = PagingMode::CopyOnWrite;
        st.flush_pending = false;
        Ok(root)
    }

    /// Materialize a private copy of `addr` in an existing CoW root.
    pub fn force_private(&self, slots: &dyn SlotRegistry, addr: u64) -> Result<(), PagingError> {
        let mut guard = self.state();
        let st = &mut *guard;
        if st.mode != PagingMode::CopyOnWrite {
            return Ok(());
        }
        let root = st.page_tables;
        let mut pages = BankPages {
            view: &mut st.view,
            banks: &mut st.banks,
            slots,
        };
        paging::cow_fault(&mut pages, root, addr, true)?;
        st.flush_pending = true;
        Ok(())
    }

    /// Drop every bank and every materialized page.
    pub fn reset_banks(&self, slots: &dyn SlotRegistry) -> Result<(), MemoryError> {
        let mut st = self.state();
        st.banks.reset(slots).map_err(MemoryError::DeleteSlot)?;
        st.view = base_view(&self.main, &self.vsyscall)?;
        st.cow_faults = 0;
        st.flush_pending = false;
        Ok(())
    }

    /// Resolve a guest write fault at `vaddr`.
    pub fn cow_fault(&self, slots: &dyn SlotRegistry, vaddr: u64) -> Result<CowOutcome, PagingError> {
        let mut guard = self.state();
        let st = &mut *guard;
        if st.mode != PagingMode::CopyOnWrite {
            return Err(PagingError::ReadOnly(vaddr));
        }
        let root = st.page_tables;
        let mut pages = BankPages {
            view: &mut st.view,
            banks: &mut st.banks,
            slots,
        };
        let outcome = paging::cow_fault(&mut pages, root, page_align_down(vaddr), false)?;
        if outcome.copied {
            st.cow_faults += 1;
            tracing::trace!(
                vaddr = format_args!("{vaddr:#x}"),
                phys = format_args!("{:#x}", outcome.phys),
                "materialized private page"
            );
        }
        Ok(outcome)
    }

    pub fn translate(&self, vaddr: u64) -> Result<Option<Translation>, PagingError> {
        let st = self.state();
        paging::translate(&st.view, st.page_tables, vaddr)
    }

    /// Write through the guest's page tables, materializing pages as needed.
    pub fn copy_to_guest(
        &self,
        slots: &dyn SlotRegistry,
        vaddr: u64,
        data: &[u8],
    ) -> Result<(), PagingError> {
        let mut guard = self.state();
        let st = &mut *guard;
        let mut done = 0usize;
        while done < data.len() {
            let addr = vaddr + done as u64;
            let len = ((PAGE_SIZE - addr % PAGE_SIZE) as usize).min(data.len() - done);
            let t = paging::translate(&st.view, st.page_tables, addr)?
                .ok_or(PagingError::NotPresent(addr))?;
            let mode = st.mode;
            let phys = match mode {
                PagingMode::Direct => t.phys,
                _ if t.writable => t.phys,
                PagingMode::CopyOnWrite if t.cloneable => {
                    let root = st.page_tables;
                    let mut pages = BankPages {
                        view: &mut st.view,
                        banks: &mut st.banks,
                        slots,
                    };
                    let outcome = paging::cow_fault(&mut pages, root, page_align_down(addr), false)?;
                    if outcome.copied {
                        st.cow_faults += 1;
                    }
                    st.flush_pending = true;
                    outcome.phys + addr % PAGE_SIZE
                }
                _ => return Err(PagingError::ReadOnly(addr)),
            };
            st.view
                .write_slice(&data[done..done + len], GuestAddress(phys))?;
            done += len;
        }
        Ok(())
    }

    /// Read through the guest's page tables.
    pub fn copy_from_guest(&self, vaddr: u64, buf: &mut [u8]) -> Result<(), PagingError> {
        let st = self.state();
        let mut done = 0usize;
        while done < buf.len() {
            let addr = vaddr + done as u64;
            let len = ((PAGE_SIZE - addr % PAGE_SIZE) as usize).min(buf.len() - done);
            let t = paging::translate(&st.view, st.page_tables, addr)?
                .ok_or(PagingError::NotPresent(addr))?;
            st.view
                .read_slice(&mut buf[done..done + len], GuestAddress(t.phys))?;
            done += len;
        }
        Ok(())
    }

    pub fn read_u64(&self, vaddr: u64) -> Result<u64, PagingError> {
        let mut bytes = [0u8; 8];
        self.copy_from_guest(vaddr, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Whether host-side page-table edits still need a guest TLB flush.
    /// Clears the request.
    pub fn take_flush_request(&self) -> bool {
        std::mem::take(&mut self.state().flush_pending)
    }

    pub fn print_pagetables(&self) -> Result<String, PagingError> {
        let st = self.state();
        paging::print_pagetables(&st.view, st.page_tables)
    }

    pub fn print_exception_handlers(&self) -> Result<String, BootError> {
        idt::print_exception_handlers(&self.state().view)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;

    /// Records slot registrations instead of talking to KVM.
    #[derive(Default)]
    pub struct FakeSlots {
        pub installed: RefCell<Vec<MemoryRegion>>,
        pub deleted: RefCell<Vec<u32>>,
        pub fail: bool,
        pub fail_delete: bool,
    }

    impl SlotRegistry for FakeSlots {
        unsafe fn install_memory(&self, region: &MemoryRegion) -> Result<(), KvmError> {
            if self.fail {
                return Err(KvmError::SetMemoryRegion(kvm_ioctls::Error::new(libc::EINVAL)));
            }
            self.installed.borrow_mut().push(*region);
            Ok(())
        }

        fn delete_memory(&self, slot: u32) -> Result<(), KvmError> {
            if self.fail_delete {
                return Err(KvmError::SetMemoryRegion(kvm_ioctls::Error::new(libc::EBUSY)));
            }
            self.deleted.borrow_mut().push(slot);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeSlots;
    use super::*;
    use crate::boot::paging::PagePermissions;
    use crate::boot::SegmentMapping;

    const MAX_MEM: u64 = 8 << 20;
    const PRIVATE: u64 = 0x20_0000;
    const BOUNDARY: u64 = 0x40_0000;
    const SHARED: u64 = 0x60_0000;

    fn vsyscall() -> Arc<GuestRegionMmap> {
        allocate_region(layout::VSYSCALL_PHYS, PAGE_SIZE).unwrap()
    }

    fn master() -> MachineMemory {
        let memory = MachineMemory::new(MAX_MEM, vsyscall()).unwrap();
        let segments = [SegmentMapping {
            vaddr: layout::BINARY_BASE,
            size: 0x1000,
            perms: PagePermissions::user(false, true),
        }];
        let info = memory
            .boot(&BootSetup {
                segments: &segments,
                binary_end: layout::BINARY_BASE + 0x1000,
                max_mem: MAX_MEM,
                remappings: &[],
                split_hugepages: false,
            })
            .unwrap();
        memory.write_phys(PRIVATE, b"master").unwrap();
        memory.make_cow(info.kernel_end, BOUNDARY).unwrap();
        memory
    }

    fn read(memory: &MachineMemory, vaddr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        memory.copy_from_guest(vaddr, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_regions() {
        let memory = MachineMemory::new(MAX_MEM, vsyscall()).unwrap();
        let main = memory.main_region();
        assert_eq!((main.slot, main.base, main.size), (0, 0, MAX_MEM));
        assert!(!main.readonly);
        let vsys = memory.vsyscall_region();
        assert_eq!((vsys.slot, vsys.base), (1, layout::VSYSCALL_PHYS));
        assert!(vsys.readonly);
        assert!(MemoryRegion::new(5, 0, 0x1000, None).readonly);
    }

    #[test]
    fn test_fork_writes_are_private() {
        let slots = FakeSlots::default();
        let master = master();
        let fork = MachineMemory::fork_of(&master).unwrap();
        let root = fork.enter_cow_mode(&slots, &[layout::IST_ADDR]).unwrap();
        assert!(root >= BANK_ARENA_BASE);
        assert!(fork.shares_main_with(&master));

        fork.copy_to_guest(&slots, PRIVATE, b"forked").unwrap();
        assert_eq!(read(&fork, PRIVATE, 6), b"forked");

        let mut original = [0u8; 6];
        master.read_phys(PRIVATE, &mut original).unwrap();
        assert_eq!(&original, b"master");
        assert_eq!(fork.cow_faults(), 1);
        assert!(fork.take_flush_request());
        assert!(!fork.take_flush_request());
    }

    #[test]
    fn test_writes_above_boundary_are_shared() {
        let slots = FakeSlots::default();
        let master = master();
        let fork = MachineMemory::fork_of(&master).unwrap();
        fork.enter_cow_mode(&slots, &[]).unwrap();
        fork.copy_to_guest(&slots, SHARED, b"shared").unwrap();

        let mut seen = [0u8; 6];
        master.read_phys(SHARED, &mut seen).unwrap();
        assert_eq!(&seen, b"shared");
        assert_eq!(fork.cow_faults(), 0);
    }

    #[test]
    fn test_interrupt_stack_is_private() {
        let slots = FakeSlots::default();
        let master = master();
        let fork = MachineMemory::fork_of(&master).unwrap();
        fork.enter_cow_mode(&slots, &[layout::IST_ADDR]).unwrap();
        let t = fork.translate(layout::IST_ADDR).unwrap().unwrap();
        assert!(t.phys >= BANK_ARENA_BASE);
        assert!(t.writable && !t.user);
        let m = master.translate(layout::IST_ADDR).unwrap().unwrap();
        assert_eq!(m.phys, layout::IST_ADDR);
    }

    #[test]
    fn test_reset_discards_private_pages() {
        let slots = FakeSlots::default();
        let master = master();
        let fork = MachineMemory::fork_of(&master).unwrap();
        fork.enter_cow_mode(&slots, &[layout::IST_ADDR]).unwrap();
        fork.copy_to_guest(&slots, PRIVATE, b"dirty!").unwrap();
        let banks = slots.installed.borrow().len();

        fork.reset_banks(&slots).unwrap();
        assert!(!fork.has_banks());
        assert_eq!(slots.deleted.borrow().len(), banks);
        fork.enter_cow_mode(&slots, &[layout::IST_ADDR]).unwrap();
        assert_eq!(read(&fork, PRIVATE, 6), b"master");
        assert_eq!(fork.cow_faults(), 0);
    }

    #[test]
    fn test_reset_reports_failed_slot_removal() {
        let mut slots = FakeSlots::default();
        let master = master();
        let fork = MachineMemory::fork_of(&master).unwrap();
        fork.enter_cow_mode(&slots, &[layout::IST_ADDR]).unwrap();
        fork.copy_to_guest(&slots, PRIVATE, b"dirty!").unwrap();

        slots.fail_delete = true;
        assert!(matches!(
            fork.reset_banks(&slots),
            Err(MemoryError::DeleteSlot(_))
        ));
        // the private page is still there, and still private
        assert!(fork.has_banks());
        assert_eq!(read(&fork, PRIVATE, 6), b"dirty!");

        slots.fail_delete = false;
        fork.reset_banks(&slots).unwrap();
        assert!(!fork.has_banks());
    }

    #[test]
    fn test_text_is_not_writable() {
        let slots = FakeSlots::default();
        let master = master();
        let fork = MachineMemory::fork_of(&master).unwrap();
        fork.enter_cow_mode(&slots, &[]).unwrap();
        assert!(matches!(
            fork.copy_to_guest(&slots, layout::BINARY_BASE, &[0x90]),
            Err(PagingError::ReadOnly(_))
        ));
        assert!(matches!(
            fork.cow_fault(&slots, layout::BINARY_BASE),
            Err(PagingError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_flat_mode_rejects_protected_writes() {
        let slots = FakeSlots::default();
        let master = master();
        assert_eq!(master.set_flat(), layout::PT_ADDR);
        assert!(matches!(
            master.copy_to_guest(&slots, PRIVATE, b"x"),
            Err(PagingError::ReadOnly(_))
        ));
        master.copy_to_guest(&slots, SHARED, b"x").unwrap();
    }

    #[test]
    fn test_direct_mode_writes_in_place() {
        let slots = FakeSlots::default();
        let memory = master();
        memory.copy_to_guest(&slots, PRIVATE + 0xffe, b"span").unwrap();
        let mut buf = [0u8; 4];
        memory.read_phys(PRIVATE + 0xffe, &mut buf).unwrap();
        assert_eq!(&buf, b"span");
        assert!(slots.installed.borrow().is_empty());
    }

    #[test]
    fn test_cross_page_copy_materializes_both_pages() {
        let slots = FakeSlots::default();
        let master = master();
        let fork = MachineMemory::fork_of(&master).unwrap();
        fork.enter_cow_mode(&slots, &[]).unwrap();
        fork.copy_to_guest(&slots, PRIVATE + 0xffc, &[0xab; 8]).unwrap();
        assert_eq!(fork.cow_faults(), 2);
        assert_eq!(read(&fork, PRIVATE + 0xffc, 8), vec![0xab; 8]);
    }

    #[test]
    fn test_work_memory_limit() {
        let slots = FakeSlots::default();
        let master = master();
        let fork = MachineMemory::fork_of(&master).unwrap();
        fork.enter_cow_mode(&slots, &[]).unwrap();
        // the root and the tables on the path already count
        fork.set_max_pages(1);
        assert!(matches!(
            fork.copy_to_guest(&slots, PRIVATE, b"x"),
            Err(PagingError::Memory(MemoryError::WorkMemoryExhausted { .. }))
        ));
    }

    #[test]
    fn test_clear() {
        let memory = master();
        memory.clear().unwrap();
        let mut buf = [0xffu8; 6];
        memory.read_phys(PRIVATE, &mut buf).unwrap();
        assert_eq!(buf, [0; 6]);
    }

    #[test]
    fn test_print_pagetables() {
        let master = master();
        let dump = master.print_pagetables().unwrap();
        assert!(dump.starts_with("PML4 at 0xa000"));
        assert!(dump.contains("RU-C"));
    }
}
