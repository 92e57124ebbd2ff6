//! CPU exception codes.
//!
//! There is no code `0x02` in this contract. An earlier emulator revision raised
//! `INVALID_MEMORY = 0x02` for out-of-bounds access; the current contract treats
//! out-of-bounds loads as reading zero and out-of-bounds stores as silently
//! dropped (see the design notes on memory access), so that code is never issued.

/// A CPU exception code, written into `sys0` when an exception handler is entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    DivideByZero = 0x00,
    InvalidInstruction = 0x01,
    UnprivilegedInvocation = 0x03,
    UnprivilegedMemory = 0x04,
    StackOverflow = 0x05,
    StackUnderflow = 0x06,
}

impl ExceptionCode {
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x}", self.code())
    }
}
