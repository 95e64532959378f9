//! One virtual CPU: register access, guest entry and exit classification.
//!
//! # Port protocol
//!
//! The guest talks to the host through `out` instructions issued by the
//! ring-0 trampolines. [`classify_port`] turns the port number into a
//! [`VcpuExit`]: a system call, an exception vector or the timer vector.
//! Anything else is guest port I/O and reaches the machine's I/O handler.
//!
//! # Register access
//!
//! When the host supports `KVM_CAP_SYNC_REGS`, general and special
//! registers travel through the shared `kvm_run` page instead of separate
//! ioctls. The kernel fills that page on every exit and applies dirty
//! entries on the next entry, so the page is only authoritative once the
//! vCPU has run at least once. Until then the ioctls are used.

use super::timer::TimeoutTimer;
use super::{Hypervisor, KvmError};
use crate::boot::layout::INTR_ASM_ADDR;
use crate::boot::trampoline::{vcpu_table_address, EXCEPTION_PORT_BASE, SYSCALL_PORT, TIMER_PORT};
use crate::boot::{cr0, cr4, gdt, long_mode_sregs, tss};
use kvm_bindings::{
    kvm_fpu, kvm_guest_debug, kvm_mp_state, kvm_msr_entry, kvm_regs, kvm_segment, kvm_sregs,
    kvm_xcrs, Msrs, KVM_GUESTDBG_ENABLE, KVM_GUESTDBG_SINGLESTEP, KVM_MP_STATE_RUNNABLE,
};
use kvm_ioctls::{SyncReg, VcpuExit as KvmVcpuExit};
use std::sync::Arc;
use std::time::Duration;

/// MSRs programmed on every new vCPU.
mod msr {
    pub const STAR: u32 = 0xc000_0081;
    pub const LSTAR: u32 = 0xc000_0082;
    /// 32-bit SYSCALL target, unused by a 64-bit guest.
    pub const CSTAR: u32 = 0xc000_0083;
    /// RFLAGS bits cleared on SYSCALL.
    pub const SYSCALL_MASK: u32 = 0xc000_0084;
    pub const KERNEL_GS_BASE: u32 = 0xc000_0102;
    pub const IA32_MISC_ENABLE: u32 = 0x1a0;
    pub const MTRR_DEF_TYPE: u32 = 0x2ff;

    pub const MISC_ENABLE_FAST_STRING: u64 = 1;
    /// MTRRs enabled, default type write-back.
    pub const MTRR_ENABLE_WRITEBACK: u64 = (1 << 11) | 6;
}

/// SYSCALL loads CS from STAR[47:32] (kernel code 0x08); SYSRET loads
/// CS from STAR[63:48] + 16 (user code 0x2b).
const STAR_VALUE: u64 = (0x08 << 32) | (0x1b << 48);

/// SYSCALL entry inside the interrupt blob.
const LSTAR_VALUE: u64 = INTR_ASM_ADDR + 0x10;

/// Bytes written by one guest `out`.
///
/// `out` moves 1, 2 or 4 bytes, so the data lives inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortData {
    bytes: [u8; 4],
    size: u8,
}

impl PortData {
    /// Keep at most the first four bytes of `data`.
    pub fn new(data: &[u8]) -> Self {
        let size = data.len().min(4);
        let mut bytes = [0u8; 4];
        bytes[..size].copy_from_slice(&data[..size]);
        Self {
            bytes,
            size: size as u8,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.size)]
    }

    /// The bytes as a zero-extended little-endian value, the way the guest
    /// held them in AL, AX or EAX.
    pub fn value(&self) -> u32 {
        u32::from_le_bytes(self.bytes)
    }
}

/// Exit reasons from vCPU execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcpuExit {
    /// The SYSCALL trampoline reported in; RAX holds the call number. The
    /// exit stub arrives here too.
    Syscall,

    /// An exception slot reported in.
    Exception { vector: u8 },

    /// The timer vector fired.
    Timer,

    /// `out` to a port with no meaning to the machine.
    IoOut { port: u16, data: PortData },

    /// `in` from any port. The guest reads all ones.
    IoIn { port: u16 },

    Hlt,

    /// Triple fault or explicit shutdown.
    Shutdown,

    /// Single-step or breakpoint.
    Debug,

    /// `KVM_RUN` returned `EINTR`, normally from the timeout signal.
    Interrupted,

    /// Failed to enter guest mode, with the hardware reason code.
    FailEntry(u64),

    InternalError,

    SystemEvent(u32),

    Unknown(&'static str),
}

/// Map an `out` port to the exit it stands for.
pub fn classify_port(port: u16, data: &[u8]) -> VcpuExit {
    match port {
        SYSCALL_PORT => VcpuExit::Syscall,
        TIMER_PORT => VcpuExit::Timer,
        p if (EXCEPTION_PORT_BASE..TIMER_PORT).contains(&p) => VcpuExit::Exception {
            vector: (p - EXCEPTION_PORT_BASE) as u8,
        },
        _ => VcpuExit::IoOut {
            port,
            data: PortData::new(data),
        },
    }
}

/// Special registers for additional vCPU `id`, derived from the primary's.
///
/// Each additional vCPU gets its own TSS (and with it its own interrupt
/// stacks) and its own entry in the per-vCPU table behind GS. Write
/// protection is off so that supervisor-mode writes from the trampolines
/// never fault on pages shared with the primary.
pub fn derive_smp_sregs(template: &kvm_sregs, id: u32, page_tables: u64) -> kvm_sregs {
    let mut sregs = *template;
    sregs.tr = tss::tss_segment(tss::smp_tss_address(id));
    sregs.gs.base = vcpu_table_address(id);
    sregs.cr3 = page_tables;
    sregs.cr0 &= !cr0::WP;
    sregs
}

/// Load ring-3 selectors into CS, SS and the data segment registers unless
/// CS already is a user segment. FS and GS keep their bases.
///
/// Returns whether `sregs` changed.
pub fn user_segments(sregs: &mut kvm_sregs) -> bool {
    if sregs.cs.dpl == 3 {
        return false;
    }
    let data = gdt::user_data_segment();
    let (fs_base, gs_base) = (sregs.fs.base, sregs.gs.base);
    sregs.cs = gdt::user_code_segment();
    sregs.ss = data;
    sregs.ds = data;
    sregs.es = data;
    sregs.fs = kvm_segment {
        base: fs_base,
        ..data
    };
    sregs.gs = kvm_segment {
        base: gs_base,
        ..data
    };
    true
}

/// Human-readable register dump.
pub struct RegisterDump<'a> {
    pub regs: &'a kvm_regs,
    pub sregs: &'a kvm_sregs,
}

impl std::fmt::Display for RegisterDump<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let r = self.regs;
        let s = self.sregs;
        writeln!(
            f,
            "RIP {:#018x}  RSP {:#018x}  RFLAGS {:#x}",
            r.rip, r.rsp, r.rflags
        )?;
        let gprs = [
            ("RAX", r.rax),
            ("RBX", r.rbx),
            ("RCX", r.rcx),
            ("RDX", r.rdx),
            ("RSI", r.rsi),
            ("RDI", r.rdi),
            ("RBP", r.rbp),
            ("R8 ", r.r8),
            ("R9 ", r.r9),
            ("R10", r.r10),
            ("R11", r.r11),
            ("R12", r.r12),
            ("R13", r.r13),
            ("R14", r.r14),
            ("R15", r.r15),
        ];
        for row in gprs.chunks(4) {
            let line: Vec<String> = row
                .iter()
                .map(|(name, value)| format!("{name} {value:#018x}"))
                .collect();
            writeln!(f, "{}", line.join("  "))?;
        }
        writeln!(
            f,
            "CR0 {:#x}  CR3 {:#x}  CR4 {:#x}  EFER {:#x}",
            s.cr0, s.cr3, s.cr4, s.efer
        )?;
        write!(
            f,
            "CS {:#x} (dpl {})  SS {:#x}  FS base {:#x}  GS base {:#x}",
            s.cs.selector, s.cs.dpl, s.ss.selector, s.fs.base, s.gs.base
        )
    }
}

/// One virtual CPU of a machine.
pub struct Vcpu {
    fd: kvm_ioctls::VcpuFd,
    cpu_id: u32,
    hv: Arc<Hypervisor>,
    timer: Option<TimeoutTimer>,
    sync: bool,
    synced: bool,
}

impl Vcpu {
    /// Wrap a freshly created vCPU and apply the host-dependent state:
    /// XCR0, the SYSCALL MSRs, the FPU control words and the MP state.
    pub fn new(
        mut fd: kvm_ioctls::VcpuFd,
        cpu_id: u32,
        hv: Arc<Hypervisor>,
    ) -> Result<Self, KvmError> {
        let sync = hv.sync_regs();
        if sync {
            fd.set_sync_valid_reg(SyncReg::Register);
            fd.set_sync_valid_reg(SyncReg::SystemRegister);
        }
        let vcpu = Self {
            fd,
            cpu_id,
            hv,
            timer: None,
            sync,
            synced: false,
        };
        vcpu.setup_features()?;
        vcpu.setup_fpu()?;
        vcpu.set_runnable()?;
        Ok(vcpu)
    }

    pub fn cpu_id(&self) -> u32 {
        self.cpu_id
    }

    fn setup_features(&self) -> Result<(), KvmError> {
        let features = self.hv.features();
        if features.xsave {
            let mut xcrs = kvm_xcrs {
                nr_xcrs: 1,
                ..Default::default()
            };
            xcrs.xcrs[0].xcr = 0;
            xcrs.xcrs[0].value = features.xcr0();
            self.fd.set_xcrs(&xcrs).map_err(KvmError::SetXcrs)?;
        }

        let msr_entry = |index: u32, data: u64| kvm_msr_entry {
            index,
            data,
            ..Default::default()
        };
        let entries = [
            msr_entry(msr::STAR, STAR_VALUE),
            msr_entry(msr::LSTAR, LSTAR_VALUE),
            msr_entry(msr::CSTAR, 0),
            msr_entry(msr::SYSCALL_MASK, 0),
            msr_entry(msr::KERNEL_GS_BASE, 0),
            msr_entry(msr::IA32_MISC_ENABLE, msr::MISC_ENABLE_FAST_STRING),
            msr_entry(msr::MTRR_DEF_TYPE, msr::MTRR_ENABLE_WRITEBACK),
        ];
        let msrs = Msrs::from_entries(&entries)
            .map_err(|_| KvmError::SetMsrs(kvm_ioctls::Error::new(libc::EINVAL)))?;
        let written = self.fd.set_msrs(&msrs).map_err(KvmError::SetMsrs)?;
        if written != entries.len() {
            tracing::warn!(
                vcpu = self.cpu_id,
                written,
                expected = entries.len(),
                "KVM accepted only some MSRs"
            );
        }
        Ok(())
    }

    /// Default x87 control word and MXCSR.
    pub fn setup_fpu(&self) -> Result<(), KvmError> {
        let fpu = kvm_fpu {
            fcw: 0x37f,
            mxcsr: 0x1f80,
            ..Default::default()
        };
        self.fd.set_fpu(&fpu).map_err(KvmError::SetRegisters)
    }

    pub fn set_runnable(&self) -> Result<(), KvmError> {
        let state = kvm_mp_state {
            mp_state: KVM_MP_STATE_RUNNABLE,
        };
        self.fd.set_mp_state(state).map_err(KvmError::SetMpState)
    }

    /// Load 64-bit user-mode special registers pointing at `page_tables`.
    pub fn program_long_mode(&mut self, page_tables: u64) -> Result<(), KvmError> {
        let base = self.special_registers()?;
        let sregs = long_mode_sregs(&base, self.hv.features(), page_tables);
        self.set_special_registers(&sregs)
    }

    fn use_sync(&self) -> bool {
        self.sync && self.synced
    }

    pub fn registers(&self) -> Result<kvm_regs, KvmError> {
        if self.use_sync() {
            Ok(self.fd.sync_regs().regs)
        } else {
            self.fd.get_regs().map_err(KvmError::GetRegisters)
        }
    }

    pub fn set_registers(&mut self, regs: &kvm_regs) -> Result<(), KvmError> {
        if self.use_sync() {
            self.fd.sync_regs_mut().regs = *regs;
            self.fd.set_sync_dirty_reg(SyncReg::Register);
            Ok(())
        } else {
            self.fd.set_regs(regs).map_err(KvmError::SetRegisters)
        }
    }

    pub fn special_registers(&self) -> Result<kvm_sregs, KvmError> {
        if self.use_sync() {
            Ok(self.fd.sync_regs().sregs)
        } else {
            self.fd.get_sregs().map_err(KvmError::GetRegisters)
        }
    }

    pub fn set_special_registers(&mut self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        if self.use_sync() {
            self.fd.sync_regs_mut().sregs = *sregs;
            self.fd.set_sync_dirty_reg(SyncReg::SystemRegister);
            Ok(())
        } else {
            self.fd.set_sregs(sregs).map_err(KvmError::SetRegisters)
        }
    }

    /// Drop every cached translation of this vCPU.
    ///
    /// Toggling CR4.PGE through two `KVM_SET_SREGS` calls makes KVM reset
    /// the vCPU's MMU context. The second call restores the real value.
    pub fn flush_tlb(&mut self) -> Result<(), KvmError> {
        let sregs = self.special_registers()?;
        let mut toggled = sregs;
        toggled.cr4 ^= cr4::PGE;
        self.fd.set_sregs(&toggled).map_err(KvmError::SetRegisters)?;
        self.fd.set_sregs(&sregs).map_err(KvmError::SetRegisters)?;
        if self.use_sync() {
            self.fd.sync_regs_mut().sregs = sregs;
            self.fd.clear_sync_dirty_reg(SyncReg::SystemRegister);
        }
        Ok(())
    }

    /// Return to ring 3 if the vCPU was left in a trampoline.
    ///
    /// See [`user_segments`]. Returns whether the selectors changed.
    pub fn enter_usermode(&mut self) -> Result<bool, KvmError> {
        let mut sregs = self.special_registers()?;
        if !user_segments(&mut sregs) {
            return Ok(false);
        }
        self.set_special_registers(&sregs)?;
        Ok(true)
    }

    /// FS and GS base addresses.
    pub fn fs_gs(&self) -> Result<(u64, u64), KvmError> {
        let sregs = self.special_registers()?;
        Ok((sregs.fs.base, sregs.gs.base))
    }

    pub fn set_fs_base(&mut self, base: u64) -> Result<(), KvmError> {
        let mut sregs = self.special_registers()?;
        sregs.fs.base = base;
        self.set_special_registers(&sregs)
    }

    pub fn print_registers(&self) -> Result<String, KvmError> {
        let regs = self.registers()?;
        let sregs = self.special_registers()?;
        Ok(RegisterDump {
            regs: &regs,
            sregs: &sregs,
        }
        .to_string())
    }

    pub fn set_single_step(&self, enabled: bool) -> Result<(), KvmError> {
        let debug = kvm_guest_debug {
            control: if enabled {
                KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP
            } else {
                0
            },
            ..Default::default()
        };
        self.fd
            .set_guest_debug(&debug)
            .map_err(KvmError::SetGuestDebug)
    }

    /// Ask KVM to translate `vaddr` with the vCPU's current CR3.
    pub fn translate(&self, vaddr: u64) -> Result<Option<u64>, KvmError> {
        let t = self
            .fd
            .translate_gva(vaddr)
            .map_err(|source| KvmError::Translate { addr: vaddr, source })?;
        Ok((t.valid != 0).then_some(t.physical_address))
    }

    /// Arm the timeout timer for this thread, creating it on first use or
    /// when the vCPU moved to another thread.
    pub fn arm_timeout(&mut self, timeout: Duration) -> Result<(), KvmError> {
        let timer = match &mut self.timer {
            Some(timer) if timer.targets_current_thread() => timer,
            slot => slot.insert(TimeoutTimer::new()?),
        };
        timer.arm(timeout)
    }

    pub fn disarm_timeout(&mut self) -> Result<(), KvmError> {
        match &mut self.timer {
            Some(timer) => timer.disarm(),
            None => Ok(()),
        }
    }

    /// Enter the guest once and classify the exit.
    pub fn run_once(&mut self) -> Result<VcpuExit, KvmError> {
        let exit = match self.fd.run() {
            Ok(exit) => exit,
            Err(e) if e.errno() == libc::EINTR => {
                self.synced = true;
                return Ok(VcpuExit::Interrupted);
            }
            Err(e) => return Err(KvmError::Run(e)),
        };
        let exit = match exit {
            KvmVcpuExit::IoOut(port, data) => classify_port(port, data),
            KvmVcpuExit::IoIn(port, data) => {
                data.fill(0xff);
                VcpuExit::IoIn { port }
            }
            KvmVcpuExit::Hlt => VcpuExit::Hlt,
            KvmVcpuExit::Shutdown => VcpuExit::Shutdown,
            KvmVcpuExit::Debug(_) => VcpuExit::Debug,
            KvmVcpuExit::InternalError => VcpuExit::InternalError,
            KvmVcpuExit::SystemEvent(event, _) => VcpuExit::SystemEvent(event),
            KvmVcpuExit::FailEntry(reason, _) => VcpuExit::FailEntry(reason),

            KvmVcpuExit::MmioRead(..) => VcpuExit::Unknown("MmioRead"),
            KvmVcpuExit::MmioWrite(..) => VcpuExit::Unknown("MmioWrite"),
            KvmVcpuExit::Hypercall(_) => VcpuExit::Unknown("Hypercall"),
            KvmVcpuExit::Exception => VcpuExit::Unknown("Exception"),
            KvmVcpuExit::IrqWindowOpen => VcpuExit::Unknown("IrqWindowOpen"),
            KvmVcpuExit::Nmi => VcpuExit::Unknown("Nmi"),
            _ => VcpuExit::Unknown("Other"),
        };
        self.synced = true;
        Ok(exit)
    }
}

impl std::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vcpu")
            .field("cpu_id", &self.cpu_id)
            .field("sync_regs", &self.sync)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::layout;
    use crate::boot::trampoline::exception_port;

    #[test]
    fn test_classify_control_ports() {
        assert_eq!(classify_port(0x00, &[7, 0, 0, 0]), VcpuExit::Syscall);
        assert_eq!(classify_port(0xa0, &[0]), VcpuExit::Timer);
    }

    #[test]
    fn test_classify_exception_ports() {
        assert_eq!(
            classify_port(exception_port(14), &[0]),
            VcpuExit::Exception { vector: 14 }
        );
        assert_eq!(
            classify_port(exception_port(0), &[0]),
            VcpuExit::Exception { vector: 0 }
        );
        assert_eq!(
            classify_port(exception_port(20), &[0]),
            VcpuExit::Exception { vector: 20 }
        );
    }

    #[test]
    fn test_classify_other_ports() {
        match classify_port(0x3f8, b"A") {
            VcpuExit::IoOut { port, data } => {
                assert_eq!(port, 0x3f8);
                assert_eq!(data.bytes(), b"A");
            }
            other => panic!("unexpected exit {other:?}"),
        }
        assert!(matches!(classify_port(0x7f, &[0]), VcpuExit::IoOut { .. }));
        // the exit stub no longer owns a port
        assert!(matches!(classify_port(0xff, &[0]), VcpuExit::IoOut { .. }));
    }

    #[test]
    fn test_smp_sregs() {
        let template = kvm_sregs {
            cr0: cr0::PE | cr0::WP | cr0::PG,
            cr3: 0xa000,
            ..Default::default()
        };
        let sregs = derive_smp_sregs(&template, 3, 0x70_0000_0000);
        assert_eq!(sregs.cr3, 0x70_0000_0000);
        assert_eq!(sregs.cr0 & cr0::WP, 0);
        assert_ne!(sregs.cr0 & cr0::PG, 0);
        assert_eq!(sregs.tr.base, layout::TSS_SMP_ADDR + 2 * tss::TSS_SIZE);
        assert_eq!(sregs.gs.base, vcpu_table_address(3));
        assert_eq!(template.cr0 & cr0::WP, cr0::WP);
    }

    #[test]
    fn test_port_data() {
        let data = PortData::new(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(data.bytes(), &[1, 2, 3, 4]);
        assert_eq!(data.value(), 0x0403_0201);
        let data = PortData::new(&[0x34, 0x12]);
        assert_eq!(data.value(), 0x1234);
        assert!(PortData::new(&[]).bytes().is_empty());
    }

    fn kernel_sregs() -> kvm_sregs {
        let mut sregs = kvm_sregs {
            cs: gdt::kernel_code_segment(),
            ss: gdt::kernel_data_segment(),
            ..Default::default()
        };
        sregs.fs.base = 0x7000_1000;
        sregs.gs.base = vcpu_table_address(0);
        sregs
    }

    #[test]
    fn test_user_segments_from_kernel() {
        let mut sregs = kernel_sregs();
        assert!(user_segments(&mut sregs));
        assert_eq!(sregs.cs.selector, 0x2b);
        assert_eq!(sregs.cs.dpl, 3);
        for seg in [sregs.ss, sregs.ds, sregs.es, sregs.fs, sregs.gs] {
            assert_eq!(seg.selector, 0x23);
            assert_eq!(seg.dpl, 3);
        }
        assert_eq!(sregs.fs.base, 0x7000_1000);
        assert_eq!(sregs.gs.base, vcpu_table_address(0));
    }

    #[test]
    fn test_user_segments_keeps_user_mode() {
        let mut sregs = kernel_sregs();
        user_segments(&mut sregs);
        sregs.fs.base = 0x1234;
        let before = sregs;
        assert!(!user_segments(&mut sregs));
        assert_eq!(sregs.fs.base, before.fs.base);
        assert_eq!(sregs.cs.selector, before.cs.selector);
    }

    #[test]
    fn test_register_dump() {
        let regs = kvm_regs {
            rip: 0x10_0005,
            rax: 42,
            r15: 0xdead,
            ..Default::default()
        };
        let mut sregs = kernel_sregs();
        user_segments(&mut sregs);
        let dump = RegisterDump {
            regs: &regs,
            sregs: &sregs,
        }
        .to_string();
        assert!(dump.starts_with("RIP 0x0000000000100005"));
        assert!(dump.contains("RAX 0x000000000000002a"));
        assert!(dump.contains("R15 0x000000000000dead"));
        assert!(dump.contains("CS 0x2b (dpl 3)"));
        assert!(dump.contains("FS base 0x70001000"));
    }

    #[test]
    fn test_lstar_points_at_syscall_entry() {
        use crate::boot::trampoline::InterruptHeader;
        assert_eq!(
            LSTAR_VALUE,
            InterruptHeader::new().translated_syscall(INTR_ASM_ADDR)
        );
    }
}
