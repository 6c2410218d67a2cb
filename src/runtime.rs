//! Runtime context injected into stub emission.
//!
//! Stubs call into a small set of shared runtime routines and address
//! fields of the current thread's control block. Both are resolved by the
//! embedding runtime before compilation starts and passed in as plain data;
//! nothing here is global, so stubs are testable against substitute
//! addresses and layouts.

use core::fmt;

/// The absolute address of a runtime-resolved routine.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CodeAddr(u64);

impl CodeAddr {
    /// Wraps a raw address.
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// The raw address value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for CodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeAddr({:#x})", self.0)
    }
}

/// Resolved entry points of the shared routines stubs dispatch to.
#[derive(Clone, Copy, Debug)]
pub struct RuntimeRoutines {
    /// The suspend/handshake handler a safepoint poll stub tail-jumps
    /// into. Resumes execution at the published resume address by its own
    /// mechanism; it never returns to the stub.
    pub safepoint_handler: CodeAddr,
    /// The method entry barrier, an ordinary call expected to return.
    pub entry_barrier: CodeAddr,
    /// The full unlock routine behind the lightweight-unlock slow path.
    pub unlock_slow_path: CodeAddr,
}

/// Byte offsets of the thread-control-block fields addressed by generated
/// code, relative to the pinned thread register.
#[derive(Clone, Copy, Debug)]
pub struct ThreadLayout {
    /// Slot receiving the resume address published by a safepoint poll
    /// stub.
    pub resume_pc_offset: i32,
    /// Word polled by the inline safepoint check.
    pub poll_word_offset: i32,
    /// Word compared by the inline method entry guard.
    pub guard_word_offset: i32,
    /// Field holding the thread's lightweight lock stack top. The value
    /// stored in that field is itself a thread-relative byte offset, so the
    /// slot just above the topmost held lock is `[thread + top]`.
    pub lock_stack_top_offset: i32,
}

/// Width of one lightweight lock stack slot, in bytes.
pub const LOCK_SLOT_BYTES: i32 = 8;

/// Bit tested in the thread's poll word by the inline safepoint check.
pub const POLL_BIT: u8 = 1;

/// Everything stub emission needs from the embedding runtime.
#[derive(Clone, Copy, Debug)]
pub struct RuntimeEnv {
    /// Shared routine entry points.
    pub routines: RuntimeRoutines,
    /// Thread control block layout.
    pub thread: ThreadLayout,
}

impl RuntimeEnv {
    /// Creates an emission environment. Every routine address must already
    /// be resolved: compiling a method that may need a routine before that
    /// routine exists is a precondition violation, checked here.
    pub fn new(routines: RuntimeRoutines, thread: ThreadLayout) -> Self {
        debug_assert!(routines.safepoint_handler.as_u64() != 0);
        debug_assert!(routines.entry_barrier.as_u64() != 0);
        debug_assert!(routines.unlock_slow_path.as_u64() != 0);
        Self { routines, thread }
    }
}
