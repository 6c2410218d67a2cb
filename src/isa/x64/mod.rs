//! x86-64 substrate: registers, addressing modes, instruction encoding, and
//! the assembler surface driven by stub emission.

pub mod address;
pub mod asm;
mod encoding;
pub mod regs;
