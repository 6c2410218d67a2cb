//! x64 memory addressing modes.

use super::regs::{self, Gpr};

/// A memory operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Amode {
    /// Base register plus a signed 32-bit displacement.
    ImmReg {
        /// The constant displacement.
        simm32: i32,
        /// The base register.
        base: Gpr,
    },
    /// Base register plus a scaled index register plus a signed 32-bit
    /// displacement, i.e. `base + (index << shift) + simm32`.
    ImmRegRegShift {
        simm32: i32,
        base: Gpr,
        index: Gpr,
        shift: u8,
    },
}

impl Amode {
    /// A base-plus-displacement operand.
    pub fn imm_reg(simm32: i32, base: Gpr) -> Self {
        Amode::ImmReg { simm32, base }
    }

    /// A base-plus-scaled-index operand. `shift` is the log2 of the scale;
    /// the stack pointer cannot serve as an index.
    pub fn imm_reg_reg_shift(simm32: i32, base: Gpr, index: Gpr, shift: u8) -> Self {
        debug_assert!(shift <= 3);
        debug_assert!(index != regs::rsp());
        Amode::ImmRegRegShift {
            simm32,
            base,
            index,
            shift,
        }
    }

    /// The base register encoding, for REX prefix computation.
    pub(crate) fn enc_base(&self) -> u8 {
        match self {
            Amode::ImmReg { base, .. } => base.enc(),
            Amode::ImmRegRegShift { base, .. } => base.enc(),
        }
    }

    /// The index register encoding, or zero when there is no index.
    pub(crate) fn enc_index(&self) -> u8 {
        match self {
            Amode::ImmReg { .. } => 0,
            Amode::ImmRegRegShift { index, .. } => index.enc(),
        }
    }
}
