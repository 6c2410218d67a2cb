//! Byte-level encoding utilities: REX prefixes, ModRM and SIB bytes, and
//! memory-operand layout.

use super::address::Amode;
use super::regs;
use crate::buffer::CodeBuffer;

/// Determines whether an immediate can be sign-extended from 8 bits.
pub(crate) fn low8_will_sign_extend_to_32(x: i32) -> bool {
    x == (x << 24) >> 24
}

/// Constructs a ModRM byte from its three fields.
#[inline]
pub(crate) fn encode_modrm(m0d: u8, enc_reg_g: u8, rm_e: u8) -> u8 {
    debug_assert!(m0d < 4);
    ((m0d & 3) << 6) | ((enc_reg_g & 7) << 3) | (rm_e & 7)
}

/// Constructs a SIB byte from its three fields.
#[inline]
pub(crate) fn encode_sib(shift: u8, enc_index: u8, enc_base: u8) -> u8 {
    debug_assert!(shift < 4);
    ((shift & 3) << 6) | ((enc_index & 7) << 3) | (enc_base & 7)
}

/// The REX prefix byte for the given 64-bit-operand flag and operand
/// encodings. `enc_reg` extends the ModRM reg field, `enc_index` the SIB
/// index field, and `enc_base` the ModRM rm or SIB base field.
pub(crate) fn rex_prefix(w: bool, enc_reg: u8, enc_index: u8, enc_base: u8) -> u8 {
    0x40 | ((w as u8) << 3)
        | (((enc_reg >> 3) & 1) << 2)
        | (((enc_index >> 3) & 1) << 1)
        | ((enc_base >> 3) & 1)
}

/// Emits a REX byte unless it carries no information.
pub(crate) fn emit_rex(buf: &mut CodeBuffer, rex: u8) {
    debug_assert_eq!(rex & 0xf0, 0x40);
    if rex != 0x40 {
        buf.put1(rex);
    }
}

/// Emits the ModRM byte, optional SIB byte, and displacement for a memory
/// operand, with `enc_g` in the ModRM reg field (a register encoding or an
/// opcode extension).
pub(crate) fn emit_modrm_sib_disp(buf: &mut CodeBuffer, enc_g: u8, mem_e: &Amode) {
    match *mem_e {
        Amode::ImmReg { simm32, base } => {
            let enc_e = base.enc();
            if enc_e & 7 != regs::ENC_RSP {
                // No SIB byte. rbp and r13 have no disp-less form: their
                // rm encoding with mod 0b00 means RIP-relative.
                if simm32 == 0 && enc_e & 7 != regs::ENC_RBP {
                    buf.put1(encode_modrm(0, enc_g, enc_e));
                } else if low8_will_sign_extend_to_32(simm32) {
                    buf.put1(encode_modrm(1, enc_g, enc_e));
                    buf.put1(simm32 as u8);
                } else {
                    buf.put1(encode_modrm(2, enc_g, enc_e));
                    buf.put4(simm32 as u32);
                }
            } else {
                // rsp and r12 bases: rm 0b100 selects a SIB byte, with
                // index 0b100 meaning "no index".
                let sib = encode_sib(0, 0b100, enc_e);
                if simm32 == 0 {
                    buf.put1(encode_modrm(0, enc_g, 0b100));
                    buf.put1(sib);
                } else if low8_will_sign_extend_to_32(simm32) {
                    buf.put1(encode_modrm(1, enc_g, 0b100));
                    buf.put1(sib);
                    buf.put1(simm32 as u8);
                } else {
                    buf.put1(encode_modrm(2, enc_g, 0b100));
                    buf.put1(sib);
                    buf.put4(simm32 as u32);
                }
            }
        }
        Amode::ImmRegRegShift {
            simm32,
            base,
            index,
            shift,
        } => {
            let sib = encode_sib(shift, index.enc(), base.enc());
            // mod 0b00 with SIB base 0b101 drops the base register, so rbp
            // and r13 bases always carry a displacement.
            if simm32 == 0 && base.enc() & 7 != regs::ENC_RBP {
                buf.put1(encode_modrm(0, enc_g, 0b100));
                buf.put1(sib);
            } else if low8_will_sign_extend_to_32(simm32) {
                buf.put1(encode_modrm(1, enc_g, 0b100));
                buf.put1(sib);
                buf.put1(simm32 as u8);
            } else {
                buf.put1(encode_modrm(2, enc_g, 0b100));
                buf.put1(sib);
                buf.put4(simm32 as u32);
            }
        }
    }
}
