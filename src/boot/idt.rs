//! Interrupt Descriptor Table and the exception table.
//!
//! Each CPU exception vector 0-20 (15 is reserved) and the timer vector get
//! an interrupt gate pointing at a 16-byte slot of the trampoline blob. The
//! slot reports the vector to the host through an `out` instruction, so the
//! host learns which exception fired from the I/O port alone.

use super::layout;
use super::trampoline;
use super::BootError;
use kvm_bindings::kvm_dtable;
use std::fmt::Write;
use vm_memory::{ByteValued, Bytes, GuestAddress, GuestMemoryMmap};

/// Gate type: present, DPL 0, 64-bit interrupt gate.
pub const GATE_INTERRUPT: u8 = 0x8e;

/// All gates switch to the first Interrupt Stack Table entry.
pub const GATE_IST: u8 = 1;

/// Vector the host timer is delivered on.
pub const TIMER_VECTOR: u8 = 32;

/// Number of gates in the table (vectors 0..=32).
pub const IDT_ENTRIES: usize = TIMER_VECTOR as usize + 1;

/// One 16-byte interrupt gate.
#[repr(C, packed)]
#[derive(Clone, Copy, Default, Debug)]
pub struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

// SAFETY: plain-old-data with no padding, every bit pattern is valid.
unsafe impl ByteValued for IdtEntry {}

impl IdtEntry {
    fn gate(handler: u64) -> Self {
        Self {
            offset_low: handler as u16,
            selector: u16::from(super::gdt::KERNEL_CODE_INDEX) * 8,
            ist: GATE_IST,
            type_attr: GATE_INTERRUPT,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }

    pub fn handler(&self) -> u64 {
        u64::from(self.offset_low)
            | (u64::from(self.offset_mid) << 16)
            | (u64::from(self.offset_high) << 32)
    }

    pub fn is_present(&self) -> bool {
        self.type_attr & 0x80 != 0
    }

    pub fn ist(&self) -> u8 {
        self.ist
    }
}

/// Name and error-code behaviour of one exception vector.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionInfo {
    pub name: &'static str,
    pub has_error_code: bool,
}

const fn exc(name: &'static str, has_error_code: bool) -> ExceptionInfo {
    ExceptionInfo {
        name,
        has_error_code,
    }
}

/// Architectural exceptions 0-20.
pub const EXCEPTIONS: [ExceptionInfo; 21] = [
    exc("Divide-by-zero Error", false),
    exc("Debug", false),
    exc("Non-Maskable Interrupt", false),
    exc("Breakpoint", false),
    exc("Overflow", false),
    exc("Bound Range Exceeded", false),
    exc("Invalid Opcode", false),
    exc("Device Not Available", false),
    exc("Double Fault", true),
    exc("Coprocessor Segment Overrun", false),
    exc("Invalid TSS", true),
    exc("Segment Not Present", true),
    exc("Stack-Segment Fault", true),
    exc("General Protection Fault", true),
    exc("Page Fault", true),
    exc("Reserved", false),
    exc("x87 Floating-Point Exception", false),
    exc("Alignment Check", true),
    exc("Machine Check", false),
    exc("SIMD Floating-Point Exception", false),
    exc("Virtualization Exception", false),
];

pub const PAGE_FAULT: u8 = 14;
pub const RESERVED_VECTOR: u8 = 15;

pub fn exception_name(vector: u8) -> &'static str {
    match vector {
        TIMER_VECTOR => "Timer Interrupt",
        v => EXCEPTIONS
            .get(v as usize)
            .map(|e| e.name)
            .unwrap_or("Unknown Exception"),
    }
}

pub fn has_error_code(vector: u8) -> bool {
    EXCEPTIONS
        .get(vector as usize)
        .is_some_and(|e| e.has_error_code)
}

/// Vectors that receive a gate, in table order.
pub fn gated_vectors() -> impl Iterator<Item = u8> {
    (0..EXCEPTIONS.len() as u8)
        .filter(|&v| v != RESERVED_VECTOR)
        .chain(std::iter::once(TIMER_VECTOR))
}

fn build_idt() -> [IdtEntry; IDT_ENTRIES] {
    let mut table = [IdtEntry::default(); IDT_ENTRIES];
    for vector in gated_vectors() {
        if let Some(offset) = trampoline::exception_handler_offset(vector) {
            table[vector as usize] = IdtEntry::gate(layout::INTR_ASM_ADDR + u64::from(offset));
        }
    }
    table
}

/// Write the IDT into guest memory.
pub fn setup_idt(memory: &GuestMemoryMmap) -> Result<(), BootError> {
    for (vector, entry) in build_idt().iter().enumerate() {
        memory.write_obj(*entry, GuestAddress(layout::IDT_ADDR + vector as u64 * 16))?;
    }
    Ok(())
}

/// IDTR contents.
pub fn idt_register() -> kvm_dtable {
    kvm_dtable {
        base: layout::IDT_ADDR,
        limit: (IDT_ENTRIES * core::mem::size_of::<IdtEntry>() - 1) as u16,
        ..Default::default()
    }
}

/// Human-readable listing of the gates currently in guest memory.
pub fn print_exception_handlers(memory: &GuestMemoryMmap) -> Result<String, BootError> {
    let mut out = String::new();
    for vector in 0..IDT_ENTRIES {
        let entry: IdtEntry =
            memory.read_obj(GuestAddress(layout::IDT_ADDR + vector as u64 * 16))?;
        if !entry.is_present() {
            continue;
        }
        let _ = writeln!(
            out,
            "{vector:3}: {:<32} handler={:#x} ist={}{}",
            exception_name(vector as u8),
            entry.handler(),
            entry.ist(),
            if has_error_code(vector as u8) { " (error code)" } else { "" },
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_size() {
        assert_eq!(core::mem::size_of::<IdtEntry>(), 16);
    }

    #[test]
    fn test_gates_distinct_and_strided() {
        let table = build_idt();
        let mut handlers: Vec<u64> = gated_vectors()
            .map(|v| table[v as usize].handler())
            .collect();
        assert_eq!(handlers.len(), 21);
        handlers.sort_unstable();
        for pair in handlers.windows(2) {
            assert_eq!(pair[1] - pair[0], u64::from(trampoline::EXCEPTION_STRIDE));
        }
    }

    #[test]
    fn test_reserved_vector_has_no_gate() {
        let table = build_idt();
        assert!(!table[RESERVED_VECTOR as usize].is_present());
        for v in 21..TIMER_VECTOR {
            assert!(!table[v as usize].is_present());
        }
    }

    #[test]
    fn test_all_gates_use_ist1_and_kernel_cs() {
        let table = build_idt();
        for v in gated_vectors() {
            let entry = table[v as usize];
            assert_eq!(entry.ist(), GATE_IST);
            assert_eq!({ entry.selector }, 0x08);
            assert_eq!({ entry.type_attr }, GATE_INTERRUPT);
        }
    }

    #[test]
    fn test_error_code_vectors() {
        let with_code: Vec<u8> = (0..21).filter(|&v| has_error_code(v)).collect();
        assert_eq!(with_code, vec![8, 10, 11, 12, 13, 14, 17]);
        assert!(!has_error_code(TIMER_VECTOR));
    }

    #[test]
    fn test_exception_names() {
        assert_eq!(exception_name(14), "Page Fault");
        assert_eq!(exception_name(6), "Invalid Opcode");
        assert_eq!(exception_name(TIMER_VECTOR), "Timer Interrupt");
        assert_eq!(exception_name(200), "Unknown Exception");
    }

    #[test]
    fn test_idt_register_limit() {
        assert_eq!(idt_register().limit, 33 * 16 - 1);
    }
}
