//! The x64 instruction surface driven by stub and fast-path emission.

use super::address::Amode;
use super::encoding::{self, low8_will_sign_extend_to_32};
use super::regs::Gpr;
use crate::buffer::{CodeBuffer, CodeBufferFinalized, CodeError, CodeOffset, Label, LabelUse};

/// Operand width for instructions available in more than one size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandSize {
    /// 32-bit operands.
    S32,
    /// 64-bit operands.
    S64,
}

impl OperandSize {
    fn rex_w(self) -> bool {
        match self {
            OperandSize::S32 => false,
            OperandSize::S64 => true,
        }
    }
}

/// Condition codes for conditional branches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CC {
    /// Zero / equal.
    Z,
    /// Not zero / not equal.
    NZ,
}

impl CC {
    fn get_enc(self) -> u8 {
        match self {
            CC::Z => 4,
            CC::NZ => 5,
        }
    }
}

/// An x64 assembler appending to an owned [`CodeBuffer`].
///
/// The instruction selection here is the subset that out-of-line stubs and
/// their inline checks need, not a general-purpose assembler. Branch and
/// call targets inside the buffer are labels; targets outside it are
/// absolute addresses materialized into a register first.
#[derive(Default)]
pub struct Assembler {
    buffer: CodeBuffer,
}

impl Assembler {
    /// Creates an assembler with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current emission offset.
    pub fn cur_offset(&self) -> CodeOffset {
        self.buffer.cur_offset()
    }

    /// Allocates a fresh, unbound label.
    pub fn get_label(&mut self) -> Label {
        self.buffer.get_label()
    }

    /// Binds `label` to the current offset.
    pub fn bind_label(&mut self, label: Label) {
        self.buffer.bind_label(label);
    }

    /// The underlying buffer.
    pub fn buffer(&self) -> &CodeBuffer {
        &self.buffer
    }

    /// Finalizes the underlying buffer.
    pub fn finish(self) -> Result<CodeBufferFinalized, CodeError> {
        self.buffer.finish()
    }

    /// `nop`.
    pub fn nop(&mut self) {
        self.buffer.put1(0x90);
    }

    /// `ret`.
    pub fn ret(&mut self) {
        self.buffer.put1(0xc3);
    }

    /// Pushes a 64-bit register.
    pub fn push_r(&mut self, src: Gpr) {
        encoding::emit_rex(&mut self.buffer, encoding::rex_prefix(false, 0, 0, src.enc()));
        self.buffer.put1(0x50 | src.low_bits());
    }

    /// Pops into a 64-bit register.
    pub fn pop_r(&mut self, dst: Gpr) {
        encoding::emit_rex(&mut self.buffer, encoding::rex_prefix(false, 0, 0, dst.enc()));
        self.buffer.put1(0x58 | dst.low_bits());
    }

    /// Loads a 64-bit immediate into `dst`.
    pub fn mov_ir(&mut self, imm: u64, dst: Gpr) {
        self.buffer.put1(encoding::rex_prefix(true, 0, 0, dst.enc()));
        self.buffer.put1(0xb8 | dst.low_bits());
        self.buffer.put8(imm);
    }

    /// Stores `src` to memory.
    pub fn mov_rm(&mut self, src: Gpr, addr: &Amode, size: OperandSize) {
        let rex = encoding::rex_prefix(size.rex_w(), src.enc(), addr.enc_index(), addr.enc_base());
        encoding::emit_rex(&mut self.buffer, rex);
        self.buffer.put1(0x89);
        encoding::emit_modrm_sib_disp(&mut self.buffer, src.enc(), addr);
    }

    /// Loads from memory into `dst`. A 32-bit load zeroes the upper half of
    /// the destination.
    pub fn mov_mr(&mut self, addr: &Amode, dst: Gpr, size: OperandSize) {
        let rex = encoding::rex_prefix(size.rex_w(), dst.enc(), addr.enc_index(), addr.enc_base());
        encoding::emit_rex(&mut self.buffer, rex);
        self.buffer.put1(0x8b);
        encoding::emit_modrm_sib_disp(&mut self.buffer, dst.enc(), addr);
    }

    /// Loads the absolute address of buffer offset `target` into `dst`,
    /// via a RIP-relative `lea`. The displacement is computed here from the
    /// distance between `target` and the end of this instruction, so the
    /// result is correct wherever the finished code is placed.
    pub fn lea_pc_rel(&mut self, target: CodeOffset, dst: Gpr) {
        self.buffer.put1(encoding::rex_prefix(true, dst.enc(), 0, 0));
        self.buffer.put1(0x8d);
        self.buffer.put1(encoding::encode_modrm(0, dst.enc(), 0b101));
        let insn_end = self.buffer.cur_offset() + 4;
        let disp = (target as i64) - (insn_end as i64);
        debug_assert!(i32::try_from(disp).is_ok());
        self.buffer.put4(disp as i32 as u32);
    }

    /// Adds an immediate to memory.
    pub fn add_im(&mut self, imm: i32, addr: &Amode, size: OperandSize) {
        self.alu_im(0, imm, addr, size);
    }

    /// Compares memory against an immediate.
    pub fn cmp_im(&mut self, imm: i32, addr: &Amode, size: OperandSize) {
        self.alu_im(7, imm, addr, size);
    }

    fn alu_im(&mut self, subopcode: u8, imm: i32, addr: &Amode, size: OperandSize) {
        let rex = encoding::rex_prefix(size.rex_w(), 0, addr.enc_index(), addr.enc_base());
        encoding::emit_rex(&mut self.buffer, rex);
        if low8_will_sign_extend_to_32(imm) {
            self.buffer.put1(0x83);
            encoding::emit_modrm_sib_disp(&mut self.buffer, subopcode, addr);
            self.buffer.put1(imm as u8);
        } else {
            self.buffer.put1(0x81);
            encoding::emit_modrm_sib_disp(&mut self.buffer, subopcode, addr);
            self.buffer.put4(imm as u32);
        }
    }

    /// Tests a byte in memory against an immediate mask.
    pub fn testb_mi(&mut self, imm: u8, addr: &Amode) {
        let rex = encoding::rex_prefix(false, 0, addr.enc_index(), addr.enc_base());
        encoding::emit_rex(&mut self.buffer, rex);
        self.buffer.put1(0xf6);
        encoding::emit_modrm_sib_disp(&mut self.buffer, 0, addr);
        self.buffer.put1(imm);
    }

    /// Unconditional jump to a label, patched at finalization.
    pub fn jmp_label(&mut self, target: Label) {
        let disp_off = self.buffer.cur_offset() + 1;
        self.buffer.use_label_at_offset(disp_off, target, LabelUse::JmpRel32);
        self.buffer.put1(0xe9);
        self.buffer.put4(0);
    }

    /// Calls a label, patched at finalization.
    pub fn call_label(&mut self, target: Label) {
        let disp_off = self.buffer.cur_offset() + 1;
        self.buffer.use_label_at_offset(disp_off, target, LabelUse::JmpRel32);
        self.buffer.put1(0xe8);
        self.buffer.put4(0);
    }

    /// Conditional jump to a label, patched at finalization.
    pub fn jcc_label(&mut self, cc: CC, target: Label) {
        let disp_off = self.buffer.cur_offset() + 2;
        self.buffer.use_label_at_offset(disp_off, target, LabelUse::JmpRel32);
        self.buffer.put1(0x0f);
        self.buffer.put1(0x80 | cc.get_enc());
        self.buffer.put4(0);
    }

    /// Indirect jump through a register.
    pub fn jmp_r(&mut self, reg: Gpr) {
        encoding::emit_rex(&mut self.buffer, encoding::rex_prefix(false, 0, 0, reg.enc()));
        self.buffer.put1(0xff);
        self.buffer.put1(encoding::encode_modrm(3, 4, reg.enc()));
    }

    /// Indirect call through a register.
    pub fn call_r(&mut self, reg: Gpr) {
        encoding::emit_rex(&mut self.buffer, encoding::rex_prefix(false, 0, 0, reg.enc()));
        self.buffer.put1(0xff);
        self.buffer.put1(encoding::encode_modrm(3, 2, reg.enc()));
    }
}
