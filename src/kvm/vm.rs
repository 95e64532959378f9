//! Virtual Machine creation and memory slot management.
//!
//! # VM Initialization
//!
//! Before a VM can run, two x86-specific helper areas must be placed:
//!
//! ## TSS (Task State Segment)
//!
//! Intel VT-x needs three pages of guest physical address space for the
//! real-mode TSS even though hardware task switching is never used. They go
//! at `0xffff_d000`, above the vsyscall page and below 4 GiB.
//!
//! ## Identity map
//!
//! One more page at `0xffff_c000` for the EPT identity map used while the
//! guest runs unpaged. Our guests never do, but the page must not collide
//! with guest memory either.
//!
//! No interrupt controller or PIT is created: guests are plain user-mode
//! programs and every event reaches the host through a port exit.
//!
//! # Memory Regions
//!
//! Guest memory is managed through "memory slots". Each slot maps a range of
//! guest physical addresses to host virtual addresses:
//!
//! ```text
//! Guest Physical                 Host Virtual
//! ┌──────────────────────┐       ┌──────────────────────┐
//! │ 0x0 .. max_mem       │ ────► │ main mmap (shared)   │  slot 0
//! │ 0xffff_a000          │ ────► │ vsyscall page (RO)   │  slot 1
//! │ 0x70_0000_0000 ..    │ ────► │ bank mmaps (private) │  slot 2+
//! └──────────────────────┘       └──────────────────────┘
//! ```

use super::{Hypervisor, KvmError};
use crate::boot::layout;
use crate::memory::{MemoryRegion, SlotRegistry};
use kvm_bindings::{kvm_userspace_memory_region, KVM_MEM_READONLY};
use std::sync::Arc;

/// Wrapper around the KVM VM file descriptor.
pub struct VmFd {
    vm: kvm_ioctls::VmFd,
    hv: Arc<Hypervisor>,
}

impl VmFd {
    /// Place the VT-x helper pages. Must happen before any vCPU exists.
    pub(super) fn new(vm: kvm_ioctls::VmFd, hv: Arc<Hypervisor>) -> Result<Self, KvmError> {
        vm.set_tss_address(layout::KVM_TSS_ADDR as usize)
            .map_err(KvmError::SetTssAddress)?;
        vm.set_identity_map_address(layout::KVM_IDENTITY_MAP_ADDR)
            .map_err(KvmError::SetIdentityMap)?;
        Ok(Self { vm, hv })
    }

    /// Create a vCPU and give it the host's supported CPUID.
    ///
    /// The CPUID entries must be set before the first `run()`; they decide
    /// what the guest sees for vendor, feature flags and XSAVE layout.
    pub fn create_vcpu(&self, id: u32) -> Result<kvm_ioctls::VcpuFd, KvmError> {
        let vcpu = self
            .vm
            .create_vcpu(u64::from(id))
            .map_err(KvmError::CreateVcpu)?;
        vcpu.set_cpuid2(self.hv.cpuid())
            .map_err(KvmError::SetCpuid)?;
        tracing::trace!(
            vcpu = id,
            entries = self.hv.cpuid().as_slice().len(),
            "set CPUID entries"
        );
        Ok(vcpu)
    }

    pub fn hypervisor(&self) -> &Arc<Hypervisor> {
        &self.hv
    }
}

impl SlotRegistry for VmFd {
    unsafe fn install_memory(&self, region: &MemoryRegion) -> Result<(), KvmError> {
        let flags = if region.readonly { KVM_MEM_READONLY } else { 0 };
        let mem = kvm_userspace_memory_region {
            slot: region.slot,
            guest_phys_addr: region.base,
            memory_size: region.size,
            userspace_addr: region.host_addr.unwrap_or(0),
            flags,
        };
        // SAFETY: forwarded from the caller.
        unsafe {
            self.vm
                .set_user_memory_region(mem)
                .map_err(KvmError::SetMemoryRegion)
        }
    }

    fn delete_memory(&self, slot: u32) -> Result<(), KvmError> {
        let mem = kvm_userspace_memory_region {
            slot,
            memory_size: 0,
            ..Default::default()
        };
        // SAFETY: a zero-sized region removes the slot; no host memory is
        // referenced.
        unsafe {
            self.vm
                .set_user_memory_region(mem)
                .map_err(KvmError::SetMemoryRegion)
        }
    }
}
