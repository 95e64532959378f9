//! System V AMD64 call frames for guest functions.
//!
//! ```text
//!             higher addresses
//!   ┌────────────────────────┐
//!   │ pushed strings / bytes │  written first, 8-byte aligned
//!   ├────────────────────────┤  ← aligned down to 16
//!   │ (padding)              │  when the stack-argument count is odd
//!   │ arg 7 .. arg n         │  in order, arg 7 lowest
//!   │ return address         │  ← rsp at entry, rsp + 8 is 16-aligned
//!   └────────────────────────┘
//! ```

/// Integer registers used for the first six arguments.
pub const ARGUMENT_REGISTERS: usize = 6;

/// One argument of a guest call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallArg {
    Int(u64),
    /// Copied onto the guest stack and passed by address.
    Bytes(Vec<u8>),
    /// Copied onto the guest stack with a trailing NUL and passed by address.
    Str(String),
}

impl From<u64> for CallArg {
    fn from(value: u64) -> Self {
        CallArg::Int(value)
    }
}

impl From<&str> for CallArg {
    fn from(value: &str) -> Self {
        CallArg::Str(value.to_owned())
    }
}

impl From<Vec<u8>> for CallArg {
    fn from(value: Vec<u8>) -> Self {
        CallArg::Bytes(value)
    }
}

impl CallArg {
    /// Bytes to place on the guest stack, if any.
    pub fn stack_bytes(&self) -> Option<Vec<u8>> {
        match self {
            CallArg::Int(_) => None,
            CallArg::Bytes(bytes) => Some(bytes.clone()),
            CallArg::Str(s) => {
                let mut bytes = Vec::with_capacity(s.len() + 1);
                bytes.extend_from_slice(s.as_bytes());
                bytes.push(0);
                Some(bytes)
            }
        }
    }
}

/// Register and stack contents for entering a guest function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    /// rdi, rsi, rdx, rcx, r8, r9 (unused ones are zero).
    pub registers: [u64; ARGUMENT_REGISTERS],
    /// Stack pointer at function entry.
    pub rsp: u64,
    /// Little-endian words to store at `rsp`: the return address followed
    /// by the stack arguments.
    pub stack: Vec<u8>,
}

/// Lay out a call with integer `values` below `sp`.
pub fn build_call_frame(sp: u64, values: &[u64], return_address: u64) -> CallFrame {
    let mut registers = [0u64; ARGUMENT_REGISTERS];
    let split = values.len().min(ARGUMENT_REGISTERS);
    registers[..split].copy_from_slice(&values[..split]);
    let overflow = &values[split..];

    let mut top = sp & !0xf;
    if overflow.len() % 2 == 1 {
        top -= 8;
    }
    let rsp = top - 8 * (overflow.len() as u64 + 1);

    let mut stack = Vec::with_capacity(8 * (overflow.len() + 1));
    stack.extend_from_slice(&return_address.to_le_bytes());
    for value in overflow {
        stack.extend_from_slice(&value.to_le_bytes());
    }
    CallFrame {
        registers,
        rsp,
        stack,
    }
}
