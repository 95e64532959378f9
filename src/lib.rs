//! kvmfork - boot flat 64-bit guests under KVM and fork them copy-on-write.
//!
//! A guest is a static x86-64 program that runs in ring 3 on a minimal
//! boot environment written by this crate: descriptor tables, a handful of
//! trampolines and identity-mapped page tables. There is no guest kernel;
//! system calls and exceptions exit to the host.
//!
//! ```text
//! kvm::init()                            once per process
//!   │
//!   ▼
//! Machine::new(binary, options)          VM + vCPU + main memory, booted
//!   │ prepare_copy_on_write(..)
//!   ▼
//! master.fork(&options) ──► vmcall ──► reset_to(master) ──► vmcall ...
//! ```
//!
//! This crate requires Linux with KVM support.

#[cfg(target_os = "linux")]
pub mod boot;
#[cfg(target_os = "linux")]
pub mod kvm;
#[cfg(target_os = "linux")]
pub mod loader;
#[cfg(target_os = "linux")]
pub mod machine;
#[cfg(target_os = "linux")]
pub mod memory;

#[cfg(target_os = "linux")]
pub use loader::{load, load_file, LoadedBinary, LoaderError};
#[cfg(target_os = "linux")]
pub use machine::{CallArg, IoHandler, Machine, MachineError, MachineOptions, RunStatus};
