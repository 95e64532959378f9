//! System-call routing.
//!
//! The SYSCALL trampoline reports every `syscall` instruction to the host
//! with the call number in RAX. The machine looks the number up in its
//! table; handlers read arguments from the registers and leave the result
//! in RAX. Numbers without a handler go to the machine's unhandled-call
//! handler if one is installed, else to the process-wide default, which
//! returns `-ENOSYS` until replaced.
//!
//! Forks inherit the master's table.

use super::{Machine, MachineError};
use std::sync::{PoisonError, RwLock};

/// Handler for one call number.
pub type SyscallHandler = fn(&mut Machine) -> Result<(), MachineError>;

/// Handler for call numbers without an entry.
///
/// Receives the full 64-bit number from RAX.
pub type UnhandledSyscallHandler = fn(&mut Machine, u64) -> Result<(), MachineError>;

/// Number of table entries.
pub const SYSCALL_MAX: usize = 512;

static DEFAULT_UNHANDLED: RwLock<UnhandledSyscallHandler> = RwLock::new(enosys as UnhandledSyscallHandler);

/// Replace the unhandled-call handler used by every machine without its own.
pub fn set_default_unhandled_syscall_handler(handler: UnhandledSyscallHandler) {
    *DEFAULT_UNHANDLED
        .write()
        .unwrap_or_else(PoisonError::into_inner) = handler;
}

fn default_unhandled() -> UnhandledSyscallHandler {
    *DEFAULT_UNHANDLED
        .read()
        .unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct SyscallTable {
    handlers: Vec<Option<SyscallHandler>>,
    unhandled: Option<UnhandledSyscallHandler>,
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self {
            handlers: vec![None; SYSCALL_MAX],
            unhandled: None,
        }
    }
}

impl std::fmt::Debug for SyscallTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallTable")
            .field("installed", &self.handlers.iter().flatten().count())
            .finish()
    }
}

impl SyscallTable {
    /// # Panics
    ///
    /// Panics if `nr` is not below [`SYSCALL_MAX`].
    pub fn install(&mut self, nr: u32, handler: SyscallHandler) {
        let slot = self
            .handlers
            .get_mut(nr as usize)
            .unwrap_or_else(|| panic!("system call {nr} outside the handler table"));
        *slot = Some(handler);
    }

    /// Override the process-wide default for this table.
    pub fn set_unhandled(&mut self, handler: UnhandledSyscallHandler) {
        self.unhandled = Some(handler);
    }

    pub fn get(&self, nr: u64) -> Option<SyscallHandler> {
        usize::try_from(nr)
            .ok()
            .and_then(|i| self.handlers.get(i).copied().flatten())
    }

    pub fn unhandled(&self) -> UnhandledSyscallHandler {
        self.unhandled.unwrap_or_else(default_unhandled)
    }
}

fn enosys(machine: &mut Machine, nr: u64) -> Result<(), MachineError> {
    tracing::debug!(nr, "unhandled system call");
    let mut regs = machine.registers()?;
    regs.rax = (-(libc::ENOSYS as i64)) as u64;
    machine.set_registers(&regs)
}
