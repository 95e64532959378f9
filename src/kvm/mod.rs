//! KVM (Kernel-based Virtual Machine) wrapper module.
//!
//! This module provides the process-wide hypervisor handle plus thin wrappers
//! over the VM and vCPU file descriptors.
//!
//! # KVM Architecture
//!
//! ```text
//! User Space                           Kernel Space (KVM)
//! ┌────────────────────┐               ┌──────────────────┐
//! │ Hypervisor (once)  │  /dev/kvm     │   KVM Module     │
//! │   CPUID, features ─┼──────────────►│                  │
//! │                    │               │  ┌────────────┐  │
//! │ Machine            │   ioctl()     │  │ VM State   │  │
//! │   VmFd ────────────┼──────────────►│  └────────────┘  │
//! │   Vcpu ────────────┼──────────────►│  ┌────────────┐  │
//! │     kvm_run (mmap) │◄─ sync regs ─►│  │ vCPU State │  │
//! └────────────────────┘               │  └────────────┘  │
//!                                      └──────────────────┘
//! ```
//!
//! # Initialization
//!
//! [`init`] must run once, before any machine is built and before worker
//! threads are spawned. It opens `/dev/kvm`, checks the API version and the
//! capabilities the rest of the crate relies on, captures the supported
//! CPUID table and the host features derived from it, builds the shared
//! vsyscall page, and installs the timeout signal handler. [`teardown`] drops
//! the handle again; machines that already exist hold their own reference.
//!
//! Without [`init`], every constructor fails with [`KvmError::NotInitialized`].

mod timer;
mod vcpu;
mod vm;

pub use timer::{install_signal_handler, TimeoutTimer, TIMEOUT_SIGNAL};
pub use vcpu::{
    classify_port, derive_smp_sregs, user_segments, PortData, RegisterDump, Vcpu, VcpuExit,
};
pub use vm::VmFd;

use crate::boot::{cr4, layout};
use crate::memory::{allocate_region, MemoryError};
use kvm_bindings::{kvm_cpuid_entry2, CpuId, KVM_API_VERSION, KVM_MAX_CPUID_ENTRIES};
use kvm_ioctls::{Cap, Kvm};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use vm_memory::{Bytes, GuestRegionMmap, MemoryRegionAddress};

/// Errors that can occur during KVM operations.
#[derive(Error, Debug)]
pub enum KvmError {
    /// Failed to open /dev/kvm device.
    ///
    /// This usually means:
    /// - KVM is not available (not running on Linux, or KVM module not loaded)
    /// - Insufficient permissions (user not in kvm group)
    /// - Running in a VM without nested virtualization enabled
    #[error("Failed to open /dev/kvm: {0}")]
    OpenKvm(#[source] kvm_ioctls::Error),

    #[error("Unsupported KVM API version {found} (expected {expected})")]
    ApiVersion { found: i32, expected: i32 },

    #[error("KVM lacks required capability {0}")]
    MissingCapability(&'static str),

    #[error("KVM is not initialized; call kvm::init() first")]
    NotInitialized,

    #[error("Failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    #[error("Failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    #[error("Failed to set user memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    #[error("Failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    #[error("Failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    #[error("Failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),

    /// Failed to set TSS address (required for Intel VT-x).
    #[error("Failed to set TSS address: {0}")]
    SetTssAddress(#[source] kvm_ioctls::Error),

    #[error("Failed to set identity map address: {0}")]
    SetIdentityMap(#[source] kvm_ioctls::Error),

    #[error("Failed to get supported CPUID: {0}")]
    GetSupportedCpuid(#[source] kvm_ioctls::Error),

    #[error("Failed to set CPUID: {0}")]
    SetCpuid(#[source] kvm_ioctls::Error),

    #[error("Failed to set MSRs: {0}")]
    SetMsrs(#[source] kvm_ioctls::Error),

    #[error("Failed to set XCRs: {0}")]
    SetXcrs(#[source] kvm_ioctls::Error),

    #[error("Failed to set MP state: {0}")]
    SetMpState(#[source] kvm_ioctls::Error),

    #[error("Failed to set guest debug: {0}")]
    SetGuestDebug(#[source] kvm_ioctls::Error),

    #[error("Failed to translate address {addr:#x}: {source}")]
    Translate {
        addr: u64,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("Failed to install timeout signal handler: {0}")]
    SignalHandler(#[source] nix::Error),

    #[error("Timeout timer failed: {0}")]
    Timer(#[source] nix::Error),

    #[error("Failed to build the vsyscall page: {0}")]
    VsyscallPage(String),
}

/// CPU features of the host, as reported by KVM's supported CPUID.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostFeatures {
    pub xsave: bool,
    pub avx: bool,
    pub avx512f: bool,
    pub fsgsbase: bool,
    pub smep: bool,
    pub smap: bool,
    /// Valid XCR0 bits (CPUID leaf 0xD, EAX).
    pub xcr0_supported: u64,
}

impl HostFeatures {
    pub fn from_cpuid(entries: &[kvm_cpuid_entry2]) -> Self {
        let leaf = |function: u32, index: u32| {
            entries
                .iter()
                .find(|e| e.function == function && e.index == index)
        };
        let mut features = Self::default();
        if let Some(e) = leaf(1, 0) {
            features.xsave = e.ecx & (1 << 26) != 0;
            features.avx = e.ecx & (1 << 28) != 0;
        }
        if let Some(e) = leaf(7, 0) {
            features.fsgsbase = e.ebx & (1 << 0) != 0;
            features.smep = e.ebx & (1 << 7) != 0;
            features.avx512f = e.ebx & (1 << 16) != 0;
            features.smap = e.ebx & (1 << 20) != 0;
        }
        if let Some(e) = leaf(0xd, 0) {
            features.xcr0_supported = u64::from(e.eax);
        }
        features
    }

    /// CR4 for a guest on this host.
    pub fn cr4(&self) -> u64 {
        let mut value = cr4::PAE | cr4::OSFXSR | cr4::OSXMMEXCPT;
        if self.xsave {
            value |= cr4::OSXSAVE;
        }
        if self.fsgsbase {
            value |= cr4::FSGSBASE;
        }
        if self.smep {
            value |= cr4::SMEP;
        }
        if self.smap {
            value |= cr4::SMAP;
        }
        value
    }

    /// XCR0: x87 and SSE, plus AVX and AVX-512 state when available.
    pub fn xcr0(&self) -> u64 {
        let mut wanted = 0x3;
        if self.avx {
            wanted |= 0x4;
        }
        if self.avx512f {
            wanted |= 0xe0;
        }
        let supported = if self.xcr0_supported == 0 {
            0x3
        } else {
            self.xcr0_supported
        };
        (wanted & supported) | 0x1
    }
}

/// Legacy vsyscall page: `mov eax, nr ; syscall ; ret` at the three fixed
/// entry points, `int3` everywhere else.
pub fn vsyscall_page() -> Vec<u8> {
    const ENTRIES: [(usize, u32); 3] = [
        (0x000, 96),  // gettimeofday
        (0x400, 201), // time
        (0x800, 309), // getcpu
    ];
    let mut page = vec![0xcc; layout::PAGE_SIZE as usize];
    for (offset, nr) in ENTRIES {
        let nr = nr.to_le_bytes();
        let stub = [0xb8, nr[0], nr[1], nr[2], nr[3], 0x0f, 0x05, 0xc3];
        page[offset..offset + stub.len()].copy_from_slice(&stub);
    }
    page
}

/// Process-wide KVM state.
pub struct Hypervisor {
    kvm: Kvm,
    cpuid: CpuId,
    features: HostFeatures,
    vsyscall: Arc<GuestRegionMmap>,
    sync_regs: bool,
}

impl Hypervisor {
    fn open() -> Result<Self, KvmError> {
        let kvm = Kvm::new().map_err(KvmError::OpenKvm)?;

        let version = kvm.get_api_version();
        if version != KVM_API_VERSION as i32 {
            return Err(KvmError::ApiVersion {
                found: version,
                expected: KVM_API_VERSION as i32,
            });
        }
        for (cap, name) in [(Cap::Xcrs, "XCRS"), (Cap::ReadonlyMem, "READONLY_MEM")] {
            if !kvm.check_extension(cap) {
                return Err(KvmError::MissingCapability(name));
            }
        }
        let sync_regs = kvm.check_extension(Cap::SyncRegs);

        let cpuid = kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(KvmError::GetSupportedCpuid)?;
        let features = HostFeatures::from_cpuid(cpuid.as_slice());

        let vsyscall = allocate_region(layout::VSYSCALL_PHYS, layout::PAGE_SIZE)
            .map_err(|e: MemoryError| KvmError::VsyscallPage(e.to_string()))?;
        vsyscall
            .write_slice(&vsyscall_page(), MemoryRegionAddress(0))
            .map_err(|e| KvmError::VsyscallPage(e.to_string()))?;

        tracing::info!(
            cpuid_entries = cpuid.as_slice().len(),
            sync_regs,
            ?features,
            "KVM initialized"
        );
        Ok(Self {
            kvm,
            cpuid,
            features,
            vsyscall,
            sync_regs,
        })
    }

    /// Create a VM with KVM's helper pages placed out of the guest's way.
    pub fn create_vm(self: &Arc<Self>) -> Result<VmFd, KvmError> {
        let vm = self.kvm.create_vm().map_err(KvmError::CreateVm)?;
        VmFd::new(vm, Arc::clone(self))
    }

    pub fn features(&self) -> &HostFeatures {
        &self.features
    }

    pub fn cpuid(&self) -> &CpuId {
        &self.cpuid
    }

    pub fn vsyscall(&self) -> &Arc<GuestRegionMmap> {
        &self.vsyscall
    }

    /// Whether vCPUs exchange registers through the shared `kvm_run` page.
    pub fn sync_regs(&self) -> bool {
        self.sync_regs
    }
}

static HYPERVISOR: RwLock<Option<Arc<Hypervisor>>> = RwLock::new(None);

/// Open KVM and capture host state. Idempotent.
pub fn init() -> Result<(), KvmError> {
    let mut slot = HYPERVISOR.write().unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
        return Ok(());
    }
    let hv = Hypervisor::open()?;
    install_signal_handler()?;
    *slot = Some(Arc::new(hv));
    Ok(())
}

/// Release the process-wide handle.
pub fn teardown() {
    let mut slot = HYPERVISOR.write().unwrap_or_else(PoisonError::into_inner);
    if slot.take().is_some() {
        tracing::debug!("KVM handle released");
    }
}

/// The process-wide handle, if [`init`] has run.
pub fn hypervisor() -> Result<Arc<Hypervisor>, KvmError> {
    HYPERVISOR
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or(KvmError::NotInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(function: u32, index: u32, ebx: u32, ecx: u32, eax: u32) -> kvm_cpuid_entry2 {
        kvm_cpuid_entry2 {
            function,
            index,
            eax,
            ebx,
            ecx,
            ..Default::default()
        }
    }

    #[test]
    fn test_features_from_cpuid() {
        let entries = [
            entry(1, 0, 0, (1 << 26) | (1 << 28), 0),
            entry(7, 0, (1 << 0) | (1 << 7) | (1 << 20), 0, 0),
            entry(0xd, 0, 0, 0, 0x7),
        ];
        let f = HostFeatures::from_cpuid(&entries);
        assert!(f.xsave && f.avx && f.fsgsbase && f.smep && f.smap);
        assert!(!f.avx512f);
        assert_eq!(f.xcr0(), 0x7);
        let cr4 = f.cr4();
        assert_ne!(cr4 & cr4::OSXSAVE, 0);
        assert_ne!(cr4 & cr4::SMEP, 0);
        assert_ne!(cr4 & cr4::SMAP, 0);
        assert_ne!(cr4 & cr4::FSGSBASE, 0);
    }

    #[test]
    fn test_features_absent() {
        let f = HostFeatures::from_cpuid(&[]);
        assert_eq!(f, HostFeatures::default());
        assert_eq!(f.cr4(), cr4::PAE | cr4::OSFXSR | cr4::OSXMMEXCPT);
        assert_eq!(f.xcr0(), 0x3);
    }

    #[test]
    fn test_xcr0_masked_by_host() {
        let f = HostFeatures {
            avx: true,
            avx512f: true,
            xcr0_supported: 0x7,
            ..Default::default()
        };
        assert_eq!(f.xcr0(), 0x7);
        let f = HostFeatures {
            avx: true,
            avx512f: true,
            xcr0_supported: 0xe7,
            ..Default::default()
        };
        assert_eq!(f.xcr0(), 0xe7);
    }

    #[test]
    fn test_vsyscall_page() {
        let page = vsyscall_page();
        assert_eq!(&page[..8], &[0xb8, 0x60, 0, 0, 0, 0x0f, 0x05, 0xc3]);
        assert_eq!(&page[0x400..0x408], &[0xb8, 0xc9, 0, 0, 0, 0x0f, 0x05, 0xc3]);
        assert_eq!(&page[0x800..0x808], &[0xb8, 0x35, 0x01, 0, 0, 0x0f, 0x05, 0xc3]);
        assert_eq!(page[8], 0xcc);
        assert_eq!(page.len(), 4096);
    }
}
