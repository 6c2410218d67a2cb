//! x64 register definitions.

use core::fmt;

/// A general-purpose x64 register, identified by its hardware encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gpr(u8);

impl Gpr {
    /// Creates a register from its hardware encoding.
    pub const fn new(enc: u8) -> Self {
        assert!(enc < 16);
        Self(enc)
    }

    /// The hardware encoding, 0 through 15.
    pub const fn enc(self) -> u8 {
        self.0
    }

    /// The low three bits of the encoding, used in ModRM and SIB fields.
    pub(crate) const fn low_bits(self) -> u8 {
        self.0 & 7
    }
}

static GPR_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

impl fmt::Debug for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", GPR_NAMES[self.0 as usize])
    }
}

pub(crate) const ENC_RAX: u8 = 0;
pub(crate) const ENC_RCX: u8 = 1;
pub(crate) const ENC_RDX: u8 = 2;
pub(crate) const ENC_RBX: u8 = 3;
pub(crate) const ENC_RSP: u8 = 4;
pub(crate) const ENC_RBP: u8 = 5;
pub(crate) const ENC_RSI: u8 = 6;
pub(crate) const ENC_RDI: u8 = 7;
pub(crate) const ENC_R8: u8 = 8;
pub(crate) const ENC_R9: u8 = 9;
pub(crate) const ENC_R10: u8 = 10;
pub(crate) const ENC_R11: u8 = 11;
pub(crate) const ENC_R12: u8 = 12;
pub(crate) const ENC_R13: u8 = 13;
pub(crate) const ENC_R14: u8 = 14;
pub(crate) const ENC_R15: u8 = 15;

// Constructors for the sixteen general-purpose registers.

pub fn rax() -> Gpr {
    Gpr::new(ENC_RAX)
}

pub fn rcx() -> Gpr {
    Gpr::new(ENC_RCX)
}

pub fn rdx() -> Gpr {
    Gpr::new(ENC_RDX)
}

pub fn rbx() -> Gpr {
    Gpr::new(ENC_RBX)
}

pub fn rsp() -> Gpr {
    Gpr::new(ENC_RSP)
}

pub fn rbp() -> Gpr {
    Gpr::new(ENC_RBP)
}

pub fn rsi() -> Gpr {
    Gpr::new(ENC_RSI)
}

pub fn rdi() -> Gpr {
    Gpr::new(ENC_RDI)
}

pub fn r8() -> Gpr {
    Gpr::new(ENC_R8)
}

pub fn r9() -> Gpr {
    Gpr::new(ENC_R9)
}

pub fn r10() -> Gpr {
    Gpr::new(ENC_R10)
}

pub fn r11() -> Gpr {
    Gpr::new(ENC_R11)
}

pub fn r12() -> Gpr {
    Gpr::new(ENC_R12)
}

pub fn r13() -> Gpr {
    Gpr::new(ENC_R13)
}

pub fn r14() -> Gpr {
    Gpr::new(ENC_R14)
}

pub fn r15() -> Gpr {
    Gpr::new(ENC_R15)
}

/// The scratch register available to stub emission sequences.
pub fn scratch() -> Gpr {
    r11()
}

/// The pinned thread-context register. Generated code keeps the current
/// thread's control block pointer here at all times, so thread fields are
/// addressable as `[thread + offset]`.
pub fn thread() -> Gpr {
    r15()
}
