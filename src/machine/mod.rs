//! One sandboxed guest.
//!
//! A [`Machine`] owns a VM, its primary vCPU, any additional vCPUs and the
//! guest memory. It is built from a [`LoadedBinary`] and then either used
//! directly or turned into a copy-on-write master:
//!
//! ```text
//!   Machine::new ──► vmcall / run ... ──► prepare_copy_on_write
//!                                                │
//!                     ┌──────────────────────────┼──────────────────┐
//!                     ▼                          ▼                  ▼
//!               master.fork()             master.fork()      master.fork()
//!                     │ vmcall                   │                  │
//!                     ▼                          ▼                  ▼
//!               fork.reset_to(master) ...  (private pages in banks, shared
//!                                           main memory underneath)
//! ```
//!
//! # Run loop
//!
//! [`Machine::run`] enters the guest until it reaches the exit stub, the
//! deadline passes or the stop flag is raised. The exit stub enters ring 0
//! with `syscall`, so it arrives like any other system call and is told
//! apart by its return address. System calls are dispatched through the
//! machine's [`SyscallTable`] and guest port writes go to the I/O handler.
//! Write faults on copy-on-write pages are resolved in place and the guest
//! resumes. Every other exception ends the run with
//! [`MachineError::GuestFault`].

mod call;
mod options;
mod syscall;

pub use call::{build_call_frame, CallArg, CallFrame};
pub use options::MachineOptions;
pub use syscall::{
    set_default_unhandled_syscall_handler, SyscallHandler, SyscallTable, UnhandledSyscallHandler,
    SYSCALL_MAX,
};

use crate::boot::idt::{exception_name, has_error_code, PAGE_FAULT};
use crate::boot::layout::{self, PAGE_SIZE};
use crate::boot::paging::PagingError;
use crate::boot::trampoline::{vcpu_table_address, EXIT_STUB_RETURN, VCPU_TABLE_FIELDS};
use crate::boot::{cr0, BootError, BootSetup};
use crate::kvm::{self, derive_smp_sregs, KvmError, PortData, Vcpu, VcpuExit, VmFd};
use crate::loader::{LoadedBinary, LoaderError};
use crate::memory::{MachineMemory, MemoryError, MemoryRegion, PagingMode, SlotRegistry};
use kvm_bindings::{kvm_regs, kvm_sregs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// RFLAGS for guest entry: the reserved bit plus IOPL 3, so guest code may
/// use port I/O.
const USER_RFLAGS: u64 = 0x2 | (3 << 12);

const RFLAGS_TF: u64 = 1 << 8;
const RFLAGS_RF: u64 = 1 << 16;

const DEBUG_VECTOR: u8 = 1;

/// Page-fault error code bits.
const PF_PRESENT: u64 = 1 << 0;
const PF_WRITE: u64 = 1 << 1;
const PF_USER: u64 = 1 << 2;

#[derive(Error, Debug)]
pub enum MachineError {
    #[error(transparent)]
    Kvm(#[from] KvmError),

    #[error(transparent)]
    Boot(#[from] BootError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Paging(#[from] PagingError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error("Guest {name} (vector {vector}) at rip {rip:#x}, error code {error_code:?}, address {address:?}")]
    GuestFault {
        vector: u8,
        name: &'static str,
        error_code: Option<u64>,
        rip: u64,
        address: Option<u64>,
    },

    #[error("Machine is not prepared for copy-on-write")]
    NotPrepared,

    #[error("Machine is not a fork")]
    NotForked,

    #[error("Operation is not available on a forked machine")]
    Forked,

    #[error("Machine already runs on private pages; they would be lost")]
    AlreadyPrepared,

    #[error("Cannot flatten a machine that owns memory banks")]
    FlattenUnsupported,

    #[error("Forks still share this machine's memory")]
    ForksAlive,

    #[error("vCPU {cpu} issued system call {nr}; only the primary vCPU may")]
    SmpSyscall { cpu: u32, nr: u64 },

    #[error("Guest shut down (triple fault)")]
    Shutdown,

    #[error("Unexpected vCPU exit: {0}")]
    UnexpectedExit(String),

    #[error("Invalid guest memory size {0:#x}")]
    InvalidMemorySize(u64),

    #[error("Stack address {0:#x} lies outside guest memory")]
    InvalidStack(u64),

    #[error("No vCPU {0}")]
    InvalidVcpu(u32),

    #[error("Invalid vCPU table index {0}")]
    InvalidVcpuTableIndex(u32),
}

/// Handler for guest `out` to ports the machine does not use itself.
pub type IoHandler = fn(&mut Machine, u16, PortData) -> Result<(), MachineError>;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The guest reached the exit stub. RAX holds its return value.
    Exited { return_value: u64 },
    Timeout,
    Stopped,
    /// One instruction executed.
    Stepped,
}

impl RunStatus {
    pub fn return_value(&self) -> Option<u64> {
        match self {
            RunStatus::Exited { return_value } => Some(*return_value),
            _ => None,
        }
    }
}

enum Step {
    Done(RunStatus),
    Syscall(u64),
    Io { port: u16, data: PortData },
}

/// Combine a run's outcome with the result of cleaning up after it.
///
/// The run's own result is kept; a cleanup failure is only logged.
fn keep_run_result(
    result: Result<RunStatus, MachineError>,
    cleanup: Result<(), KvmError>,
    what: &str,
) -> Result<RunStatus, MachineError> {
    if let Err(err) = cleanup {
        tracing::warn!(%err, what, "cleanup after run failed");
    }
    result
}

/// The parts of a machine one vCPU needs while it runs.
struct Executor<'a> {
    vcpu: &'a mut Vcpu,
    memory: &'a MachineMemory,
    vm: &'a VmFd,
    stopped: &'a AtomicBool,
}

impl Executor<'_> {
    fn run(&mut self, deadline: Option<Instant>, single_step: bool) -> Result<Step, MachineError> {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return Ok(Step::Done(RunStatus::Stopped));
            }
            if self.memory.take_flush_request() {
                self.vcpu.flush_tlb()?;
            }

            match self.vcpu.run_once()? {
                VcpuExit::Syscall => {
                    let regs = self.vcpu.registers()?;
                    if regs.rcx == EXIT_STUB_RETURN {
                        self.leave_exit_stub(regs)?;
                        return Ok(Step::Done(RunStatus::Exited {
                            return_value: regs.rax,
                        }));
                    }
                    return Ok(Step::Syscall(regs.rax));
                }
                VcpuExit::Exception { vector } if vector == PAGE_FAULT => self.page_fault()?,
                VcpuExit::Exception { vector } if vector == DEBUG_VECTOR && single_step => {
                    self.unwind_debug_trap()?;
                    return Ok(Step::Done(RunStatus::Stepped));
                }
                VcpuExit::Exception { vector } => return Err(self.fault(vector, None)?),
                VcpuExit::Timer => {}
                VcpuExit::Debug if single_step => return Ok(Step::Done(RunStatus::Stepped)),
                VcpuExit::Debug => {}
                VcpuExit::Interrupted => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        tracing::debug!(vcpu = self.vcpu.cpu_id(), "run timed out");
                        return Ok(Step::Done(RunStatus::Timeout));
                    }
                }
                VcpuExit::IoOut { port, data } => return Ok(Step::Io { port, data }),
                VcpuExit::IoIn { port } => tracing::trace!(port, "port read returns all ones"),
                VcpuExit::Shutdown => return Err(MachineError::Shutdown),
                other => return Err(MachineError::UnexpectedExit(format!("{other:?}"))),
            }
        }
    }

    /// Finish the exit stub's `syscall` on the host: back to ring 3 at the
    /// stub's loop, with the caller's RFLAGS from R11, as `sysretq` would.
    fn leave_exit_stub(&mut self, mut regs: kvm_regs) -> Result<(), MachineError> {
        regs.rip = EXIT_STUB_RETURN;
        regs.rflags = regs.r11;
        self.vcpu.set_registers(&regs)?;
        self.vcpu.enter_usermode()?;
        Ok(())
    }

    /// Return from the #DB slot on the host, as `iretq` would, without the
    /// trap and resume flags.
    ///
    /// Hosts that cannot intercept the single-step trap deliver it through
    /// the guest IDT; the slot's IST frame reads `[rip, cs, rflags, rsp, ss]`.
    fn unwind_debug_trap(&mut self) -> Result<(), MachineError> {
        let mut regs = self.vcpu.registers()?;
        let frame = regs.rsp;
        regs.rip = self.memory.read_u64(frame)?;
        regs.rflags = self.memory.read_u64(frame + 16)? & !(RFLAGS_TF | RFLAGS_RF);
        regs.rsp = self.memory.read_u64(frame + 24)?;
        self.vcpu.set_registers(&regs)?;
        self.vcpu.enter_usermode()?;
        Ok(())
    }

    /// Resolve a write fault, or report the fault to the caller.
    ///
    /// The page-fault slot leaves CR2 in RAX and its IST frame reads
    /// `[saved rax, error code, rip, ...]`.
    fn page_fault(&mut self) -> Result<(), MachineError> {
        let regs = self.vcpu.registers()?;
        let addr = regs.rax;
        let error_code = self.memory.read_u64(regs.rsp + 8)?;

        let user_to_supervisor = self
            .memory
            .translate(addr)?
            .is_some_and(|t| !t.user && error_code & PF_USER != 0);
        if error_code & (PF_PRESENT | PF_WRITE) != (PF_PRESENT | PF_WRITE) || user_to_supervisor {
            return Err(self.fault(PAGE_FAULT, Some(addr))?);
        }

        match self.memory.cow_fault(self.vm, addr) {
            Ok(_) => Ok(()),
            Err(PagingError::ReadOnly(_) | PagingError::NotPresent(_)) => {
                Err(self.fault(PAGE_FAULT, Some(addr))?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Describe an exception from its IST frame.
    fn fault(&self, vector: u8, address: Option<u64>) -> Result<MachineError, MachineError> {
        let regs = self.vcpu.registers()?;
        let (error_code, rip) = if vector == PAGE_FAULT {
            (
                Some(self.memory.read_u64(regs.rsp + 8)?),
                self.memory.read_u64(regs.rsp + 16)?,
            )
        } else if has_error_code(vector) {
            (
                Some(self.memory.read_u64(regs.rsp)?),
                self.memory.read_u64(regs.rsp + 8)?,
            )
        } else {
            (None, self.memory.read_u64(regs.rsp)?)
        };
        let name = exception_name(vector);
        tracing::warn!(
            vcpu = self.vcpu.cpu_id(),
            vector,
            name,
            rip = format_args!("{rip:#x}"),
            ?error_code,
            address = ?address.map(|a| format!("{a:#x}")),
            "guest fault"
        );
        Ok(MachineError::GuestFault {
            vector,
            name,
            error_code,
            rip,
            address,
        })
    }
}

/// One sandboxed virtual machine.
pub struct Machine {
    // vCPUs and the VM close before the memory they map is released.
    vcpu: Vcpu,
    smp: Vec<Vcpu>,
    vm: VmFd,
    memory: MachineMemory,
    options: MachineOptions,
    binary: Option<Arc<LoadedBinary>>,
    syscalls: SyscallTable,
    io_handler: Option<IoHandler>,
    entry_address: u64,
    exit_address: u64,
    stack_address: u64,
    kernel_end: u64,
    forked: bool,
    prepared: bool,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("max_mem", &self.memory.max_mem())
            .field("entry", &format_args!("{:#x}", self.entry_address))
            .field("stack", &format_args!("{:#x}", self.stack_address))
            .field("forked", &self.forked)
            .field("prepared", &self.prepared)
            .field("vcpus", &(1 + self.smp.len()))
            .finish()
    }
}

fn validate_memory(options: &MachineOptions) -> Result<u64, MachineError> {
    let max_mem = options.max_mem;
    if max_mem % PAGE_SIZE != 0 || max_mem <= layout::BINARY_BASE || max_mem > layout::VSYSCALL_PHYS
    {
        return Err(MachineError::InvalidMemorySize(max_mem));
    }
    let stack = options.stack_address.unwrap_or(max_mem);
    if stack <= layout::BINARY_BASE || stack > max_mem {
        return Err(MachineError::InvalidStack(stack));
    }
    Ok(stack)
}

impl Machine {
    /// Boot `binary` in a fresh VM.
    ///
    /// [`kvm::init`] must have run.
    pub fn new(binary: &LoadedBinary, options: MachineOptions) -> Result<Self, MachineError> {
        let stack_address = validate_memory(&options)?;
        let hv = kvm::hypervisor()?;
        let vm = hv.create_vm()?;
        let memory = MachineMemory::new(options.max_mem, Arc::clone(hv.vsyscall()))?;
        // SAFETY: both regions live in `memory`, which outlives `vm`.
        unsafe {
            vm.install_memory(&memory.main_region())?;
            vm.install_memory(&memory.vsyscall_region())?;
        }

        let vcpu = Vcpu::new(vm.create_vcpu(0)?, 0, Arc::clone(&hv))?;
        let mut machine = Self {
            vcpu,
            smp: Vec::new(),
            vm,
            memory,
            binary: Some(Arc::new(binary.clone())),
            options,
            syscalls: SyscallTable::default(),
            io_handler: None,
            entry_address: binary.entry,
            exit_address: layout::USER_ASM_ADDR,
            stack_address,
            kernel_end: 0,
            forked: false,
            prepared: false,
            stopped: AtomicBool::new(false),
        };
        machine.boot()?;

        tracing::info!(
            max_mem = machine.memory.max_mem(),
            entry = format_args!("{:#x}", machine.entry_address),
            kernel_end = format_args!("{:#x}", machine.kernel_end),
            "machine created"
        );
        Ok(machine)
    }

    /// Load the binary, write the boot environment and point the vCPU at
    /// the entry.
    fn boot(&mut self) -> Result<(), MachineError> {
        let binary = self.binary.clone().ok_or(MachineError::Forked)?;
        let mappings = binary.mappings();
        let setup = BootSetup {
            segments: &mappings,
            binary_end: binary.end,
            max_mem: self.memory.max_mem(),
            remappings: &self.options.remappings,
            split_hugepages: self.options.split_hugepages,
        };
        let info = self.memory.boot(&setup)?;
        for segment in &binary.segments {
            self.memory
                .write_phys(segment.vaddr, binary.segment_data(segment))?;
        }
        self.kernel_end = info.kernel_end;

        self.vcpu.program_long_mode(info.page_tables)?;
        self.vcpu.setup_fpu()?;
        self.setup_registers(self.entry_address, self.stack_address)?;

        if self.options.verbose {
            tracing::info!(tables = %self.memory.print_pagetables()?, "page tables");
        }
        Ok(())
    }

    /// Fresh general registers: `rip = start`, `rsp = stack`, in ring 3.
    pub fn setup_registers(&mut self, start: u64, stack: u64) -> Result<(), MachineError> {
        let regs = kvm_regs {
            rip: start,
            rsp: stack,
            rflags: USER_RFLAGS,
            ..Default::default()
        };
        self.vcpu.enter_usermode()?;
        self.set_registers(&regs)
    }

    /// Reload the binary and rebuild the boot environment.
    pub fn reset(&mut self) -> Result<(), MachineError> {
        if self.forked {
            return Err(MachineError::Forked);
        }
        if self.memory.main_is_shared() {
            return Err(MachineError::ForksAlive);
        }
        self.memory.reset_banks(&self.vm)?;
        self.memory.clear()?;
        self.prepared = false;
        self.stopped.store(false, Ordering::Release);
        self.boot()?;
        self.vcpu.flush_tlb()?;
        tracing::debug!("machine reset");
        Ok(())
    }

    /// A new machine sharing this prepared master's memory.
    pub fn fork(&self, options: &MachineOptions) -> Result<Machine, MachineError> {
        if !self.prepared {
            return Err(MachineError::NotPrepared);
        }
        let hv = kvm::hypervisor()?;
        let vm = hv.create_vm()?;
        let memory = MachineMemory::fork_of(&self.memory)?;
        // SAFETY: the regions are kept alive by `memory`, which outlives `vm`.
        unsafe {
            vm.install_memory(&memory.main_region())?;
            vm.install_memory(&memory.vsyscall_region())?;
        }
        memory.set_max_pages(options.max_cow_mem / PAGE_SIZE);
        let vcpu = Vcpu::new(vm.create_vcpu(0)?, 0, hv)?;

        let mut fork = Machine {
            vcpu,
            smp: Vec::new(),
            vm,
            memory,
            options: options.clone(),
            binary: None,
            syscalls: self.syscalls.clone(),
            io_handler: self.io_handler,
            entry_address: self.entry_address,
            exit_address: self.exit_address,
            stack_address: self.stack_address,
            kernel_end: self.kernel_end,
            forked: true,
            prepared: false,
            stopped: AtomicBool::new(false),
        };
        fork.setup_cow_mode(self)?;
        tracing::debug!("machine forked");
        Ok(fork)
    }

    /// Give this machine a private page-table root cloned from the master's
    /// main tables and the master's registers.
    fn setup_cow_mode(&mut self, master: &Machine) -> Result<(), MachineError> {
        let root = self.memory.enter_cow_mode(&self.vm, &[layout::IST_ADDR])?;
        let regs = master.vcpu.registers()?;
        let mut sregs = master.vcpu.special_registers()?;
        sregs.cr3 = root;
        self.vcpu.set_special_registers(&sregs)?;
        self.vcpu.set_registers(&regs)?;
        self.vcpu.flush_tlb()?;
        Ok(())
    }

    /// Recycle a fork: drop its private pages and take `master`'s state.
    pub fn reset_to(&mut self, master: &Machine) -> Result<(), MachineError> {
        if !self.forked {
            return Err(MachineError::NotForked);
        }
        if !master.prepared {
            return Err(MachineError::NotPrepared);
        }
        self.memory.reset_banks(&self.vm)?;
        if !self.memory.shares_main_with(&master.memory) {
            self.vm.delete_memory(0)?;
            self.memory.rebind_main(&master.memory)?;
            // SAFETY: the new main region is kept alive by `self.memory`.
            unsafe { self.vm.install_memory(&self.memory.main_region())? };
        }
        self.setup_cow_mode(master)?;
        self.stopped.store(false, Ordering::Release);
        Ok(())
    }

    /// Turn this machine into a copy-on-write master.
    ///
    /// Every writable page between the end of the boot structures and
    /// `shared_boundary` (zero: all of memory) becomes read-only and
    /// cloneable. With `max_work_mem == 0` the machine keeps running on the
    /// main tables and such writes fault for good; otherwise it gets its own
    /// banks and materializes private pages like a fork.
    pub fn prepare_copy_on_write(
        &mut self,
        max_work_mem: u64,
        shared_boundary: u64,
    ) -> Result<(), MachineError> {
        if self.forked {
            return Err(MachineError::Forked);
        }
        let boundary = if shared_boundary == 0 {
            u64::MAX
        } else {
            shared_boundary
        };

        if max_work_mem == 0 {
            if self.memory.has_banks() {
                return Err(MachineError::FlattenUnsupported);
            }
            self.memory.make_cow(self.kernel_end, boundary)?;
            let root = self.memory.set_flat();
            let mut sregs = self.vcpu.special_registers()?;
            sregs.cr3 = root;
            sregs.cr0 |= cr0::WP;
            self.vcpu.set_special_registers(&sregs)?;
            self.vcpu.enter_usermode()?;
        } else {
            if self.memory.has_banks() {
                return Err(MachineError::AlreadyPrepared);
            }
            self.memory.set_max_pages(max_work_mem / PAGE_SIZE);
            self.memory.make_cow(self.kernel_end, boundary)?;
            let root = self.memory.enter_cow_mode(&self.vm, &[layout::IST_ADDR])?;
            let mut sregs = self.vcpu.special_registers()?;
            sregs.cr3 = root;
            self.vcpu.set_special_registers(&sregs)?;
        }
        self.vcpu.flush_tlb()?;
        self.smp_vcpu_broadcast()?;
        self.prepared = true;

        tracing::debug!(
            max_work_mem,
            boundary = format_args!("{boundary:#x}"),
            mode = ?self.memory.mode(),
            "prepared for copy-on-write"
        );
        if self.options.verbose {
            tracing::info!(tables = %self.memory.print_pagetables()?, "page tables");
        }
        Ok(())
    }

    fn executor(&mut self) -> Executor<'_> {
        Executor {
            vcpu: &mut self.vcpu,
            memory: &self.memory,
            vm: &self.vm,
            stopped: &self.stopped,
        }
    }

    /// Run the primary vCPU until the guest exits, `timeout` passes or the
    /// machine is stopped.
    pub fn run(&mut self, timeout: Option<Duration>) -> Result<RunStatus, MachineError> {
        let deadline = match timeout {
            Some(t) if !t.is_zero() => {
                self.vcpu.arm_timeout(t)?;
                Some(Instant::now() + t)
            }
            _ => None,
        };
        let result = self.run_loop(deadline, false);
        let disarmed = match deadline {
            Some(_) => self.vcpu.disarm_timeout(),
            None => Ok(()),
        };
        keep_run_result(result, disarmed, "disarm timeout")
    }

    fn run_loop(
        &mut self,
        deadline: Option<Instant>,
        single_step: bool,
    ) -> Result<RunStatus, MachineError> {
        loop {
            match self.executor().run(deadline, single_step)? {
                Step::Done(status) => return Ok(status),
                Step::Syscall(nr) => self.dispatch_syscall(nr)?,
                Step::Io { port, data } => self.dispatch_io(port, data)?,
            }
        }
    }

    fn dispatch_syscall(&mut self, nr: u64) -> Result<(), MachineError> {
        match self.syscalls.get(nr) {
            Some(handler) => handler(self),
            None => (self.syscalls.unhandled())(self, nr),
        }
    }

    fn dispatch_io(&mut self, port: u16, data: PortData) -> Result<(), MachineError> {
        match self.io_handler {
            Some(handler) => handler(self, port, data),
            None => {
                tracing::trace!(port, value = data.value(), "ignored port write");
                Ok(())
            }
        }
    }

    /// Execute exactly one guest instruction.
    ///
    /// Guest debugging is switched off again however the step ends.
    pub fn step_one(&mut self) -> Result<RunStatus, MachineError> {
        self.vcpu.set_single_step(true)?;
        let result = self.run_loop(None, true);
        let cleared = self.vcpu.set_single_step(false);
        keep_run_result(result, cleared, "clear single-step")
    }

    /// Call the guest function at `addr` and run it to completion.
    pub fn vmcall(
        &mut self,
        addr: u64,
        args: &[CallArg],
        timeout: Option<Duration>,
    ) -> Result<RunStatus, MachineError> {
        self.setup_call(addr, args)?;
        self.run(timeout)
    }

    /// Prepare registers and stack for a call to `addr` returning into the
    /// exit stub.
    pub fn setup_call(&mut self, addr: u64, args: &[CallArg]) -> Result<(), MachineError> {
        let mut sp = self.stack_address;
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                CallArg::Int(v) => values.push(*v),
                other => {
                    let bytes = other.stack_bytes().unwrap_or_default();
                    sp = self.stack_push(sp, &bytes)?;
                    values.push(sp);
                }
            }
        }

        let frame = build_call_frame(sp, &values, self.exit_address);
        self.copy_to_guest(frame.rsp, &frame.stack)?;

        self.vcpu.enter_usermode()?;
        let [rdi, rsi, rdx, rcx, r8, r9] = frame.registers;
        let regs = kvm_regs {
            rip: addr,
            rsp: frame.rsp,
            rflags: USER_RFLAGS,
            rdi,
            rsi,
            rdx,
            rcx,
            r8,
            r9,
            ..Default::default()
        };
        self.set_registers(&regs)
    }

    /// Push `data` below `sp` and return the new, 8-byte aligned `sp`.
    pub fn stack_push(&mut self, sp: u64, data: &[u8]) -> Result<u64, MachineError> {
        let sp = (sp - data.len() as u64) & !7;
        self.copy_to_guest(sp, data)?;
        Ok(sp)
    }

    /// Write through the guest's page tables, materializing private pages
    /// where needed.
    pub fn copy_to_guest(&mut self, vaddr: u64, data: &[u8]) -> Result<(), MachineError> {
        Ok(self.memory.copy_to_guest(&self.vm, vaddr, data)?)
    }

    pub fn copy_from_guest(&self, vaddr: u64, buf: &mut [u8]) -> Result<(), MachineError> {
        Ok(self.memory.copy_from_guest(vaddr, buf)?)
    }

    /// Guest physical address of `vaddr`, or `None` when unmapped.
    pub fn translate(&self, vaddr: u64) -> Result<Option<u64>, MachineError> {
        if let Some(t) = self.memory.translate(vaddr)? {
            return Ok(Some(t.phys));
        }
        Ok(self.vcpu.translate(vaddr)?)
    }

    /// Register a memory slot with this machine's VM.
    ///
    /// # Safety
    ///
    /// The host memory behind `region` must stay mapped until the slot is
    /// deleted or the machine is dropped.
    pub unsafe fn install_memory(&self, region: &MemoryRegion) -> Result<(), KvmError> {
        // SAFETY: forwarded from the caller.
        unsafe { self.vm.install_memory(region) }
    }

    pub fn delete_memory(&self, slot: u32) -> Result<(), KvmError> {
        self.vm.delete_memory(slot)
    }

    /// Start `count` additional vCPUs sharing this machine's memory.
    ///
    /// # Panics
    ///
    /// Panics if the total exceeds [`layout::SMP_MAX`] additional vCPUs.
    pub fn smp_init(&mut self, count: u32) -> Result<(), MachineError> {
        let first = self.smp.len() as u32 + 1;
        let last = first + count;
        assert!(
            last - 1 <= layout::SMP_MAX,
            "at most {} additional vCPUs",
            layout::SMP_MAX
        );

        if self.memory.mode() == PagingMode::CopyOnWrite {
            for page in (layout::IST_SMP_ADDR..layout::PT_ADDR).step_by(PAGE_SIZE as usize) {
                self.memory.force_private(&self.vm, page)?;
            }
        }
        let template = self.vcpu.special_registers()?;
        let hv = Arc::clone(self.vm.hypervisor());
        for id in first..last {
            let mut vcpu = Vcpu::new(self.vm.create_vcpu(id)?, id, Arc::clone(&hv))?;
            let sregs = derive_smp_sregs(&template, id, self.memory.page_tables());
            vcpu.set_special_registers(&sregs)?;
            self.smp.push(vcpu);
        }
        tracing::debug!(count, total = self.smp.len() + 1, "additional vCPUs created");
        Ok(())
    }

    /// Push the primary's special registers to every additional vCPU.
    pub fn smp_vcpu_broadcast(&mut self) -> Result<(), MachineError> {
        if self.smp.is_empty() {
            return Ok(());
        }
        let template = self.vcpu.special_registers()?;
        let root = self.memory.page_tables();
        for vcpu in &mut self.smp {
            let sregs = derive_smp_sregs(&template, vcpu.cpu_id(), root);
            vcpu.set_special_registers(&sregs)?;
            vcpu.flush_tlb()?;
        }
        Ok(())
    }

    /// Run `entry` on the first `stacks.len()` additional vCPUs at once,
    /// each on its own thread with `rsp` from `stacks` and its vCPU id in
    /// `rdi`. System calls from these vCPUs end their run with an error.
    pub fn run_smp(
        &mut self,
        entry: u64,
        stacks: &[u64],
        timeout: Option<Duration>,
    ) -> Result<Vec<RunStatus>, MachineError> {
        assert!(
            stacks.len() <= self.smp.len(),
            "{} stacks for {} additional vCPUs",
            stacks.len(),
            self.smp.len()
        );
        let exit_address = self.exit_address;
        for (vcpu, &stack) in self.smp.iter_mut().zip(stacks) {
            let frame = build_call_frame(stack, &[u64::from(vcpu.cpu_id())], exit_address);
            self.memory.copy_to_guest(&self.vm, frame.rsp, &frame.stack)?;
            let regs = kvm_regs {
                rip: entry,
                rsp: frame.rsp,
                rflags: USER_RFLAGS,
                rdi: frame.registers[0],
                ..Default::default()
            };
            vcpu.enter_usermode()?;
            vcpu.set_registers(&regs)?;
        }
        if self.memory.take_flush_request() {
            for vcpu in self.smp.iter_mut().take(stacks.len()) {
                vcpu.flush_tlb()?;
            }
        }

        let memory = &self.memory;
        let vm = &self.vm;
        let stopped = &self.stopped;
        std::thread::scope(|scope| {
            let workers: Vec<_> = self
                .smp
                .iter_mut()
                .take(stacks.len())
                .map(|vcpu| {
                    scope.spawn(move || run_smp_vcpu(vcpu, memory, vm, stopped, timeout))
                })
                .collect();
            workers
                .into_iter()
                .map(|worker| {
                    worker
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                })
                .collect()
        })
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn install_syscall_handler(&mut self, nr: u32, handler: SyscallHandler) {
        self.syscalls.install(nr, handler);
    }

    /// Handle numbers without an entry on this machine (and its later
    /// forks) instead of with the process-wide default.
    pub fn install_unhandled_syscall_handler(&mut self, handler: UnhandledSyscallHandler) {
        self.syscalls.set_unhandled(handler);
    }

    /// Receive guest port writes on the primary vCPU. Forks inherit the
    /// handler. Without one, writes are dropped.
    pub fn install_io_handler(&mut self, handler: IoHandler) {
        self.io_handler = Some(handler);
    }

    pub fn registers(&self) -> Result<kvm_regs, MachineError> {
        Ok(self.vcpu.registers()?)
    }

    pub fn set_registers(&mut self, regs: &kvm_regs) -> Result<(), MachineError> {
        Ok(self.vcpu.set_registers(regs)?)
    }

    pub fn special_registers(&self) -> Result<kvm_sregs, MachineError> {
        Ok(self.vcpu.special_registers()?)
    }

    pub fn set_special_registers(&mut self, sregs: &kvm_sregs) -> Result<(), MachineError> {
        Ok(self.vcpu.set_special_registers(sregs)?)
    }

    /// FS and GS base of the primary vCPU.
    pub fn fs_gs(&self) -> Result<(u64, u64), MachineError> {
        Ok(self.vcpu.fs_gs()?)
    }

    /// Point FS, the guest's thread pointer, at `base`.
    pub fn set_tls_base(&mut self, base: u64) -> Result<(), MachineError> {
        Ok(self.vcpu.set_fs_base(base)?)
    }

    /// Store `value` in field `index` of `cpu`'s entry in the per-vCPU
    /// table, which the guest reads through GS. Field 0 holds the vCPU id.
    ///
    /// The table lives in memory shared with forks, so only an unforked
    /// machine may write it.
    pub fn set_vcpu_table_at(
        &mut self,
        cpu: u32,
        index: u32,
        value: i32,
    ) -> Result<(), MachineError> {
        if index >= VCPU_TABLE_FIELDS {
            return Err(MachineError::InvalidVcpuTableIndex(index));
        }
        if cpu > layout::SMP_MAX {
            return Err(MachineError::InvalidVcpu(cpu));
        }
        if self.forked {
            return Err(MachineError::Forked);
        }
        let addr = vcpu_table_address(cpu) + u64::from(index) * 4;
        Ok(self.memory.write_phys(addr, &value.to_le_bytes())?)
    }

    pub fn print_registers(&self) -> Result<String, MachineError> {
        Ok(self.vcpu.print_registers()?)
    }

    /// Pages materialized by write faults since the last reset.
    pub fn cow_faults(&self) -> u64 {
        self.memory.cow_faults()
    }

    pub fn bank_count(&self) -> usize {
        self.memory.bank_count()
    }

    pub fn print_pagetables(&self) -> Result<String, MachineError> {
        Ok(self.memory.print_pagetables()?)
    }

    pub fn print_exception_handlers(&self) -> Result<String, MachineError> {
        Ok(self.memory.print_exception_handlers()?)
    }

    pub fn entry_address(&self) -> u64 {
        self.entry_address
    }

    pub fn exit_address(&self) -> u64 {
        self.exit_address
    }

    pub fn stack_address(&self) -> u64 {
        self.stack_address
    }

    pub fn set_stack_address(&mut self, stack: u64) {
        self.stack_address = stack;
    }

    /// First guest physical address above the boot structures.
    pub fn kernel_end(&self) -> u64 {
        self.kernel_end
    }

    pub fn max_mem(&self) -> u64 {
        self.memory.max_mem()
    }

    pub fn is_forked(&self) -> bool {
        self.forked
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn paging_mode(&self) -> PagingMode {
        self.memory.mode()
    }

    pub fn vcpu_count(&self) -> usize {
        1 + self.smp.len()
    }

    pub fn options(&self) -> &MachineOptions {
        &self.options
    }
}

fn run_smp_vcpu(
    vcpu: &mut Vcpu,
    memory: &MachineMemory,
    vm: &VmFd,
    stopped: &AtomicBool,
    timeout: Option<Duration>,
) -> Result<RunStatus, MachineError> {
    let deadline = match timeout {
        Some(t) if !t.is_zero() => {
            vcpu.arm_timeout(t)?;
            Some(Instant::now() + t)
        }
        _ => None,
    };
    let cpu = vcpu.cpu_id();
    let mut executor = Executor {
        vcpu,
        memory,
        vm,
        stopped,
    };
    let result = loop {
        match executor.run(deadline, false) {
            Ok(Step::Done(status)) => break Ok(status),
            Ok(Step::Syscall(nr)) => break Err(MachineError::SmpSyscall { cpu, nr }),
            Ok(Step::Io { port, data }) => {
                tracing::trace!(cpu, port, value = data.value(), "ignored port write");
            }
            Err(e) => break Err(e),
        }
    };
    let disarmed = match deadline {
        Some(_) => executor.vcpu.disarm_timeout(),
        None => Ok(()),
    };
    keep_run_result(result, disarmed, "disarm timeout")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_ioctl() -> Result<(), KvmError> {
        Err(KvmError::SetGuestDebug(kvm_ioctls::Error::new(libc::EBADF)))
    }

    #[test]
    fn test_run_error_outlives_cleanup_error() {
        let result = keep_run_result(Err(MachineError::Shutdown), failed_ioctl(), "test");
        assert!(matches!(result, Err(MachineError::Shutdown)));
    }

    #[test]
    fn test_run_status_outlives_cleanup_error() {
        let result = keep_run_result(Ok(RunStatus::Timeout), failed_ioctl(), "test");
        assert_eq!(result.unwrap(), RunStatus::Timeout);
        let result = keep_run_result(Ok(RunStatus::Stepped), Ok(()), "test");
        assert_eq!(result.unwrap(), RunStatus::Stepped);
    }
}
