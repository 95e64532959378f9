//! Relocatable guest code: the syscall entry, the exception slots, the
//! user-mode exit stub and the per-vCPU table.
//!
//! The guest never runs host-provided kernel code beyond these few bytes.
//! Each ring-0 entry point reports to the host with a single `out`
//! instruction and the host decides what happens next from the port number:
//!
//! ```text
//! port 0x00         SYSCALL (eax holds the call number)
//! port 0x80 + v     exception vector v
//! port 0xa0         timer interrupt (vector 32)
//! ```
//!
//! The exit stub runs in ring 3 and issues no port I/O itself. It executes
//! `syscall`, so the host sees an ordinary system call whose saved return
//! address (RCX) is [`EXIT_STUB_RETURN`].
//!
//! User page at `USER_ASM_ADDR`:
//!
//! ```text
//! +0x000  exit stub:  syscall ; jmp $-4
//! +0x800  per-vCPU table, 16 bytes per vCPU, GS base of each vCPU
//!         [0] cpu id  [1..3] free for the host
//! ```
//!
//! Blob layout at `INTR_ASM_ADDR`:
//!
//! ```text
//! +0x00  header { syscall_offset, exception_offset, stride }
//! +0x10  syscall entry:   out 0, eax ; sysretq
//! +0x40  slot 0 .. slot 20 (16 bytes each), slot 21 = timer
//! ```
//!
//! Page-fault slot, exactly one stride long:
//!
//! ```text
//! 50             push rax
//! 0f 20 d0       mov  rax, cr2
//! e6 8e          out  0x8e, al        ; host resolves the fault here
//! 0f 01 38       invlpg [rax]
//! 58             pop  rax
//! 48 83 c4 08    add  rsp, 8          ; drop error code
//! 48 cf          iretq
//! ```

use super::idt::{has_error_code, PAGE_FAULT, TIMER_VECTOR};
use super::layout;
use super::BootError;
use vm_memory::{ByteValued, Bytes, GuestAddress, GuestMemoryMmap};

pub const SYSCALL_PORT: u16 = 0x00;
pub const EXCEPTION_PORT_BASE: u16 = 0x80;
pub const TIMER_PORT: u16 = EXCEPTION_PORT_BASE + TIMER_VECTOR as u16;

pub const SYSCALL_OFFSET: u16 = 0x10;
pub const EXCEPTION_OFFSET: u16 = 0x40;
pub const EXCEPTION_STRIDE: u16 = 16;

/// Number of exception slots, including the timer.
pub const EXCEPTION_SLOTS: u16 = 22;
const TIMER_SLOT: u16 = 21;

/// Total blob length.
pub const BLOB_SIZE: usize = (EXCEPTION_OFFSET + EXCEPTION_SLOTS * EXCEPTION_STRIDE) as usize;

/// `syscall ; jmp $-4`
pub const EXIT_STUB: [u8; 4] = [0x0f, 0x05, 0xeb, 0xfc];

/// RCX as saved by the exit stub's `syscall`.
pub const EXIT_STUB_RETURN: u64 = layout::USER_ASM_ADDR + 2;

pub const VCPU_TABLE_ADDR: u64 = layout::USER_ASM_ADDR + 0x800;
pub const VCPU_TABLE_ENTRY: u64 = 16;

/// 32-bit fields per table entry.
pub const VCPU_TABLE_FIELDS: u32 = 4;

/// GS base of vCPU `cpu` (0 is the primary).
pub const fn vcpu_table_address(cpu: u32) -> u64 {
    VCPU_TABLE_ADDR + VCPU_TABLE_ENTRY * cpu as u64
}

const NOP: u8 = 0x90;
const IRETQ: [u8; 2] = [0x48, 0xcf];
const DROP_ERROR_CODE: [u8; 4] = [0x48, 0x83, 0xc4, 0x08];

#[repr(C)]
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct InterruptHeader {
    pub syscall_offset: u16,
    pub exception_offset: u16,
    pub stride: u16,
}

// SAFETY: three u16 fields, no padding.
unsafe impl ByteValued for InterruptHeader {}

impl InterruptHeader {
    pub const fn new() -> Self {
        Self {
            syscall_offset: SYSCALL_OFFSET,
            exception_offset: EXCEPTION_OFFSET,
            stride: EXCEPTION_STRIDE,
        }
    }

    /// Guest address of the SYSCALL entry once the blob sits at `base`.
    pub const fn translated_syscall(&self, base: u64) -> u64 {
        base + self.syscall_offset as u64
    }
}

/// Offset of the handler slot for `vector`, or `None` for ungated vectors.
pub fn exception_handler_offset(vector: u8) -> Option<u16> {
    let slot = match vector {
        TIMER_VECTOR => TIMER_SLOT,
        15 => return None,
        v if v < 21 => u16::from(v),
        _ => return None,
    };
    Some(EXCEPTION_OFFSET + slot * EXCEPTION_STRIDE)
}

/// I/O port the slot for `vector` reports on.
pub const fn exception_port(vector: u8) -> u16 {
    EXCEPTION_PORT_BASE + vector as u16
}

fn exception_slot(vector: u8) -> [u8; EXCEPTION_STRIDE as usize] {
    let port = exception_port(vector) as u8;
    let code: Vec<u8> = if vector == PAGE_FAULT {
        let mut c = vec![0x50, 0x0f, 0x20, 0xd0, 0xe6, port, 0x0f, 0x01, 0x38, 0x58];
        c.extend_from_slice(&DROP_ERROR_CODE);
        c.extend_from_slice(&IRETQ);
        c
    } else if has_error_code(vector) {
        let mut c = vec![0xe6, port];
        c.extend_from_slice(&DROP_ERROR_CODE);
        c.extend_from_slice(&IRETQ);
        c
    } else {
        let mut c = vec![0xe6, port];
        c.extend_from_slice(&IRETQ);
        c
    };
    let mut slot = [NOP; EXCEPTION_STRIDE as usize];
    slot[..code.len()].copy_from_slice(&code);
    slot
}

/// Assemble the interrupt blob.
pub fn build_interrupt_blob() -> Vec<u8> {
    let mut blob = vec![NOP; BLOB_SIZE];
    blob[..core::mem::size_of::<InterruptHeader>()]
        .copy_from_slice(InterruptHeader::new().as_slice());

    // out 0, eax ; sysretq
    let syscall = [0xe7, SYSCALL_PORT as u8, 0x48, 0x0f, 0x07];
    let at = SYSCALL_OFFSET as usize;
    blob[at..at + syscall.len()].copy_from_slice(&syscall);

    for vector in super::idt::gated_vectors() {
        if let Some(offset) = exception_handler_offset(vector) {
            let at = offset as usize;
            blob[at..at + EXCEPTION_STRIDE as usize].copy_from_slice(&exception_slot(vector));
        }
    }
    blob
}

/// Write the interrupt blob, the user exit stub and the per-vCPU table
/// into guest memory.
pub fn setup_trampolines(memory: &GuestMemoryMmap) -> Result<(), BootError> {
    memory.write_slice(&build_interrupt_blob(), GuestAddress(layout::INTR_ASM_ADDR))?;
    memory.write_slice(&EXIT_STUB, GuestAddress(layout::USER_ASM_ADDR))?;
    for cpu in 0..=layout::SMP_MAX {
        memory.write_obj(cpu as i32, GuestAddress(vcpu_table_address(cpu)))?;
    }
    Ok(())
}
