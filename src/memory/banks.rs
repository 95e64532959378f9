//! Memory banks: lazily allocated, page-granular working memory.
//!
//! A forked machine shares every page with its master until it writes. The
//! private copies it then needs come from banks: fixed-size anonymous
//! mappings registered with KVM as their own memory slots, placed far above
//! the guest's main memory.
//!
//! ```text
//! 0x70_0000_0000  bank 0  slot 2  128 pages
//! 0x70_0008_0000  bank 1  slot 3  128 pages
//! ...
//! ```
//!
//! Pages are handed out in increasing order within the newest bank. Banks are
//! never shrunk or reused individually; [`MemoryBanks::reset`] drops them all
//! and rewinds the address and slot counters, so the same sequence of
//! requests always produces the same addresses.

use super::{allocate_region, MemoryError, MemoryRegion};
use crate::boot::layout::PAGE_SIZE;
use crate::kvm::KvmError;
use std::sync::Arc;
use vm_memory::GuestRegionMmap;

/// Guest physical address of the first bank.
pub const BANK_ARENA_BASE: u64 = 0x70_0000_0000;

/// KVM slot of the first bank. Slot 0 is main memory, slot 1 the vsyscall page.
pub const FIRST_BANK_SLOT: u32 = 2;

/// Pages per bank.
pub const BANK_PAGES: u64 = 128;

/// Registers guest memory regions with a VM.
pub trait SlotRegistry {
    /// # Safety
    ///
    /// The host memory behind `region` must stay mapped until the slot is
    /// deleted or the VM is destroyed.
    unsafe fn install_memory(&self, region: &MemoryRegion) -> Result<(), KvmError>;

    fn delete_memory(&self, slot: u32) -> Result<(), KvmError>;
}

/// One page handed out by a bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankPage {
    /// Host address of the page.
    pub host: *mut u8,
    /// Guest physical address of the page.
    pub addr: u64,
}

/// A single bank.
#[derive(Debug)]
pub struct MemoryBank {
    region: Arc<GuestRegionMmap>,
    addr: u64,
    n_pages: u64,
    n_used: u64,
    slot: u32,
}

impl MemoryBank {
    fn allocate(addr: u64, n_pages: u64, slot: u32) -> Result<Self, MemoryError> {
        let region = allocate_region(addr, n_pages * PAGE_SIZE)?;
        Ok(Self {
            region,
            addr,
            n_pages,
            n_used: 0,
            slot,
        })
    }

    /// Hand out the next unused page.
    ///
    /// # Panics
    ///
    /// Panics if the bank is already exhausted; callers go through
    /// [`MemoryBanks::get_available_bank`] first.
    pub fn get_next_page(&mut self) -> BankPage {
        assert!(
            self.n_used < self.n_pages,
            "memory bank at {:#x} is exhausted",
            self.addr
        );
        let offset = self.n_used * PAGE_SIZE;
        self.n_used += 1;
        BankPage {
            host: self.region.as_ptr().wrapping_add(offset as usize),
            addr: self.addr + offset,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.n_used >= self.n_pages
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn size(&self) -> u64 {
        self.n_pages * PAGE_SIZE
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn n_used(&self) -> u64 {
        self.n_used
    }

    pub fn region(&self) -> &Arc<GuestRegionMmap> {
        &self.region
    }

    fn descriptor(&self) -> MemoryRegion {
        MemoryRegion::new(
            self.slot,
            self.addr,
            self.size(),
            Some(self.region.as_ptr() as u64),
        )
    }
}

/// All banks of one machine, in allocation order.
#[derive(Debug)]
pub struct MemoryBanks {
    banks: Vec<MemoryBank>,
    arena_begin: u64,
    arena_next: u64,
    slot_begin: u32,
    slot_next: u32,
    bank_pages: u64,
    max_pages: u64,
}

impl Default for MemoryBanks {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBanks {
    pub fn new() -> Self {
        Self::with_geometry(BANK_ARENA_BASE, FIRST_BANK_SLOT, BANK_PAGES)
    }

    pub fn with_geometry(arena_begin: u64, slot_begin: u32, bank_pages: u64) -> Self {
        Self {
            banks: Vec::new(),
            arena_begin,
            arena_next: arena_begin,
            slot_begin,
            slot_next: slot_begin,
            bank_pages,
            max_pages: u64::MAX,
        }
    }

    /// Cap the number of pages handed out. Zero means unlimited.
    pub fn set_max_pages(&mut self, max_pages: u64) {
        self.max_pages = if max_pages == 0 { u64::MAX } else { max_pages };
    }

    /// The newest bank if it has room, otherwise a freshly registered one.
    pub fn get_available_bank(
        &mut self,
        slots: &dyn SlotRegistry,
    ) -> Result<&mut MemoryBank, MemoryError> {
        let has_room = self.banks.last().is_some_and(|bank| !bank.is_empty());
        if !has_room {
            let bank = MemoryBank::allocate(self.arena_next, self.bank_pages, self.slot_next)?;
            // SAFETY: the bank's mapping lives in `self.banks` until `reset`
            // deletes the slot, or until the machine (and its VM) is dropped.
            unsafe { slots.install_memory(&bank.descriptor()) }
                .map_err(MemoryError::InstallSlot)?;
            tracing::debug!(
                slot = bank.slot,
                addr = format_args!("{:#x}", bank.addr),
                pages = bank.n_pages,
                "allocated memory bank"
            );
            self.arena_next += bank.size();
            self.slot_next += 1;
            self.banks.push(bank);
        }
        let last = self.banks.len() - 1;
        Ok(&mut self.banks[last])
    }

    /// Take one page, allocating a bank if needed.
    pub fn allocate_page(&mut self, slots: &dyn SlotRegistry) -> Result<BankPage, MemoryError> {
        if self.pages_used() >= self.max_pages {
            return Err(MemoryError::WorkMemoryExhausted {
                max_pages: self.max_pages,
            });
        }
        Ok(self.get_available_bank(slots)?.get_next_page())
    }

    /// Release every bank, newest first, and rewind the counters.
    ///
    /// A bank is freed only once KVM has dropped its slot. On failure the
    /// remaining banks stay allocated and the counters stay where they are,
    /// so no slot or guest address still known to KVM is handed out again.
    pub fn reset(&mut self, slots: &dyn SlotRegistry) -> Result<(), KvmError> {
        while let Some(bank) = self.banks.last() {
            slots.delete_memory(bank.slot)?;
            self.banks.pop();
        }
        self.arena_next = self.arena_begin;
        self.slot_next = self.slot_begin;
        Ok(())
    }

    pub fn contains(&self, addr: u64) -> bool {
        (self.arena_begin..self.arena_next).contains(&addr)
    }

    pub fn pages_used(&self) -> u64 {
        self.banks.iter().map(|bank| bank.n_used).sum()
    }

    pub fn len(&self) -> usize {
        self.banks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.banks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryBank> {
        self.banks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::FakeSlots;
    use super::*;

    fn small_banks() -> MemoryBanks {
        MemoryBanks::with_geometry(BANK_ARENA_BASE, FIRST_BANK_SLOT, 4)
    }

    #[test]
    fn test_new_bank_only_when_exhausted() {
        let slots = FakeSlots::default();
        let mut banks = small_banks();
        let pages: Vec<BankPage> = (0..9).map(|_| banks.allocate_page(&slots).unwrap()).collect();

        // ceil(9 / 4) banks
        assert_eq!(banks.len(), 3);
        assert_eq!(slots.installed.borrow().len(), 3);
        assert_eq!(pages[0].addr, BANK_ARENA_BASE);
        assert_eq!(pages[3].addr, BANK_ARENA_BASE + 3 * PAGE_SIZE);
        assert_eq!(pages[4].addr, BANK_ARENA_BASE + 4 * PAGE_SIZE);
        assert_eq!(pages[1].host as usize - pages[0].host as usize, PAGE_SIZE as usize);
    }

    #[test]
    fn test_banks_are_contiguous_with_increasing_slots() {
        let slots = FakeSlots::default();
        let mut banks = small_banks();
        for _ in 0..12 {
            banks.allocate_page(&slots).unwrap();
        }
        let installed = slots.installed.borrow();
        for (i, region) in installed.iter().enumerate() {
            assert_eq!(region.slot, FIRST_BANK_SLOT + i as u32);
            assert_eq!(region.base, BANK_ARENA_BASE + i as u64 * 4 * PAGE_SIZE);
            assert_eq!(region.size, 4 * PAGE_SIZE);
            assert!(!region.readonly);
        }
    }

    #[test]
    fn test_reset_reproduces_addresses() {
        let slots = FakeSlots::default();
        let mut banks = small_banks();
        let first: Vec<u64> = (0..6).map(|_| banks.allocate_page(&slots).unwrap().addr).collect();
        banks.reset(&slots).unwrap();
        assert!(banks.is_empty());
        assert_eq!(*slots.deleted.borrow(), vec![3, 2]);

        let second: Vec<u64> = (0..6).map(|_| banks.allocate_page(&slots).unwrap().addr).collect();
        assert_eq!(first, second);
        assert_eq!(slots.installed.borrow()[2].slot, FIRST_BANK_SLOT);
    }

    #[test]
    fn test_failed_delete_keeps_bank() {
        let mut slots = FakeSlots::default();
        let mut banks = small_banks();
        // two full banks
        let before: Vec<u64> = (0..8).map(|_| banks.allocate_page(&slots).unwrap().addr).collect();
        assert_eq!(banks.len(), 2);

        slots.fail_delete = true;
        assert!(banks.reset(&slots).is_err());
        assert_eq!(banks.len(), 2);
        assert!(banks.contains(before[7]));

        // new pages must not land on a slot KVM still maps
        slots.fail_delete = false;
        let next = banks.allocate_page(&slots).unwrap();
        assert!(!before.contains(&next.addr));
        let newest = slots.installed.borrow().last().unwrap().slot;
        assert!(newest > FIRST_BANK_SLOT + 1);

        banks.reset(&slots).unwrap();
        assert!(banks.is_empty());
        assert_eq!(newest, FIRST_BANK_SLOT + 2);
        assert_eq!(*slots.deleted.borrow(), vec![newest, 3, 2]);
    }

    #[test]
    fn test_fresh_bank_pages_are_zeroed() {
        let slots = FakeSlots::default();
        let mut banks = small_banks();
        let page = banks.allocate_page(&slots).unwrap();
        // SAFETY: the page belongs to a live bank.
        let bytes = unsafe { std::slice::from_raw_parts(page.host, PAGE_SIZE as usize) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_work_memory_limit() {
        let slots = FakeSlots::default();
        let mut banks = small_banks();
        banks.set_max_pages(5);
        for _ in 0..5 {
            banks.allocate_page(&slots).unwrap();
        }
        assert!(matches!(
            banks.allocate_page(&slots),
            Err(MemoryError::WorkMemoryExhausted { max_pages: 5 })
        ));
        banks.set_max_pages(0);
        banks.allocate_page(&slots).unwrap();
    }

    #[test]
    fn test_install_failure_is_reported() {
        let slots = FakeSlots {
            fail: true,
            ..Default::default()
        };
        let mut banks = small_banks();
        assert!(matches!(
            banks.allocate_page(&slots),
            Err(MemoryError::InstallSlot(_))
        ));
        assert!(banks.is_empty());
    }

    #[test]
    fn test_contains() {
        let slots = FakeSlots::default();
        let mut banks = small_banks();
        assert!(!banks.contains(BANK_ARENA_BASE));
        banks.allocate_page(&slots).unwrap();
        assert!(banks.contains(BANK_ARENA_BASE + 3 * PAGE_SIZE));
        assert!(!banks.contains(BANK_ARENA_BASE + 4 * PAGE_SIZE));
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn test_exhausted_bank_panics() {
        let slots = FakeSlots::default();
        let mut banks = small_banks();
        let bank = banks.get_available_bank(&slots).unwrap();
        for _ in 0..5 {
            bank.get_next_page();
        }
    }
}
