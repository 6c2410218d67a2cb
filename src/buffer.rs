//! In-memory code buffer with deferred label resolution.
//!
//! A [`CodeBuffer`] accumulates the machine code of one compiled method.
//! Labels are cheap `u32` indices into an append-only side table: allocating
//! a label reserves a slot holding "unknown", binding it stores the current
//! buffer offset into the slot, and every reference from an instruction
//! records a fixup. Fixups are patched when the buffer is finalized, so an
//! instruction may reference a label long before its final position is
//! known. A label is bound at most once but may be referenced any number of
//! times, before or after binding.

use core::fmt;
use log::trace;
use smallvec::SmallVec;
use thiserror::Error;

/// A byte offset from the start of a code buffer.
pub type CodeOffset = u32;

/// A label refers to an offset in a code buffer, known only once emission is
/// complete; until then it is a plain index into the buffer's label table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Label(u32);

impl Label {
    /// The raw index of this label.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "label{}", self.0)
    }
}

/// Value in the label-offset table for labels not yet bound.
const UNKNOWN_LABEL_OFFSET: CodeOffset = u32::MAX;

/// A reference to a label from a fixed position in the buffer, resolved at
/// finalization.
#[derive(Clone, Copy, Debug)]
struct LabelFixup {
    label: Label,
    offset: CodeOffset,
    kind: LabelUse,
}

/// The kinds of label references understood by the patcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelUse {
    /// A 32-bit displacement in the last four bytes of a branch or call
    /// instruction, relative to the end of that instruction.
    JmpRel32,
}

impl LabelUse {
    /// Size of the patched region, in bytes.
    pub fn patch_size(self) -> CodeOffset {
        match self {
            LabelUse::JmpRel32 => 4,
        }
    }

    /// Maximum forward reach of this reference kind.
    pub fn max_pos_range(self) -> CodeOffset {
        match self {
            LabelUse::JmpRel32 => 0x7fff_ffff,
        }
    }

    /// Maximum backward reach of this reference kind.
    pub fn max_neg_range(self) -> CodeOffset {
        match self {
            LabelUse::JmpRel32 => 0x8000_0000,
        }
    }

    /// Patches the region at `use_offset` with the resolved offset of the
    /// target label. Any addend already present in the region is added to
    /// the displacement.
    fn patch(self, buffer: &mut [u8], use_offset: CodeOffset, label_offset: CodeOffset) {
        let pc_rel = (label_offset as i64) - (use_offset as i64);
        debug_assert!(pc_rel <= self.max_pos_range() as i64);
        debug_assert!(pc_rel >= -(self.max_neg_range() as i64));
        let pc_rel = pc_rel as u32;
        match self {
            LabelUse::JmpRel32 => {
                // The displacement is relative to the end of the
                // instruction, four bytes past the start of the region.
                let addend = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
                let value = pc_rel.wrapping_add(addend).wrapping_sub(4);
                buffer.copy_from_slice(&value.to_le_bytes());
            }
        }
    }
}

/// Errors surfaced when finalizing a [`CodeBuffer`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodeError {
    /// A label was referenced by emitted code but never bound to an offset.
    #[error("{0} is referenced but never bound")]
    UnboundLabel(Label),
}

/// An append-only buffer of machine code with label fixups.
#[derive(Default)]
pub struct CodeBuffer {
    /// The buffer contents, as raw bytes.
    data: SmallVec<[u8; 1024]>,
    /// Offset each label resolves to, or `UNKNOWN_LABEL_OFFSET`.
    label_offsets: SmallVec<[CodeOffset; 16]>,
    /// Label references not yet patched.
    fixups: SmallVec<[LabelFixup; 16]>,
}

impl CodeBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current offset from the start of the buffer, i.e. the offset at which
    /// the next byte will be emitted.
    pub fn cur_offset(&self) -> CodeOffset {
        self.data.len() as CodeOffset
    }

    /// Emits one byte.
    pub fn put1(&mut self, value: u8) {
        self.data.push(value);
    }

    /// Emits four bytes, little-endian.
    pub fn put4(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Emits eight bytes, little-endian.
    pub fn put8(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Allocates a fresh label, unbound until [`CodeBuffer::bind_label`].
    pub fn get_label(&mut self) -> Label {
        let label = Label(self.label_offsets.len() as u32);
        self.label_offsets.push(UNKNOWN_LABEL_OFFSET);
        trace!("CodeBuffer: get_label -> {label}");
        label
    }

    /// Binds a label to the current offset. A label may be bound only once.
    pub fn bind_label(&mut self, label: Label) {
        trace!("CodeBuffer: bind {label} at offset {}", self.cur_offset());
        debug_assert_eq!(
            self.label_offsets[label.0 as usize],
            UNKNOWN_LABEL_OFFSET,
            "{label} is already bound",
        );
        self.label_offsets[label.0 as usize] = self.cur_offset();
    }

    /// The offset a label was bound at, or `None` if it is still unbound.
    pub fn label_offset(&self, label: Label) -> Option<CodeOffset> {
        match self.label_offsets[label.0 as usize] {
            UNKNOWN_LABEL_OFFSET => None,
            offset => Some(offset),
        }
    }

    /// Records a use of `label` at `offset` with the given reference kind.
    /// The `patch_size` bytes starting at `offset` are rewritten during
    /// [`CodeBuffer::finish`].
    pub fn use_label_at_offset(&mut self, offset: CodeOffset, label: Label, kind: LabelUse) {
        trace!("CodeBuffer: use {label} at offset {offset}, kind {kind:?}");
        self.fixups.push(LabelFixup { label, offset, kind });
    }

    /// Finalizes the buffer: patches every recorded label use and returns
    /// the completed code. Fails if any referenced label was never bound.
    pub fn finish(mut self) -> Result<CodeBufferFinalized, CodeError> {
        for fixup in core::mem::take(&mut self.fixups) {
            let LabelFixup { label, offset, kind } = fixup;
            let label_offset = self.label_offsets[label.0 as usize];
            if label_offset == UNKNOWN_LABEL_OFFSET {
                return Err(CodeError::UnboundLabel(label));
            }
            let start = offset as usize;
            let end = start + kind.patch_size() as usize;
            debug_assert!(end <= self.data.len());
            kind.patch(&mut self.data[start..end], offset, label_offset);
        }
        Ok(CodeBufferFinalized { data: self.data })
    }
}

/// A [`CodeBuffer`] once emission is complete, with every label reference
/// patched.
#[derive(Debug)]
pub struct CodeBufferFinalized {
    data: SmallVec<[u8; 1024]>,
}

impl CodeBufferFinalized {
    /// Total size of the finalized code, in bytes.
    pub fn total_size(&self) -> CodeOffset {
        self.data.len() as CodeOffset
    }

    /// The finalized machine code.
    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }
}
