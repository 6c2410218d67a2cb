//! Out-of-line code stubs and their emission driver.
//!
//! A compiled method keeps only its fast path inline. While the main body
//! is generated, each rare condition allocates labels, plants a branch to
//! an unbound stub entry, and queues a stub descriptor on a [`StubSet`].
//! Once the body is complete, [`StubSet::emit`] appends every queued stub
//! in request order, binding each entry label at the stub's first byte and
//! checking the emitted size against the stub's declared worst case. The
//! worst-case sizes let a caller reserve layout space before any stub bytes
//! exist.

use log::trace;
use smallvec::SmallVec;

use crate::buffer::{CodeOffset, Label};
use crate::isa::x64::address::Amode;
use crate::isa::x64::asm::{Assembler, CC, OperandSize};
use crate::isa::x64::regs::{self, Gpr};
use crate::runtime::{LOCK_SLOT_BYTES, POLL_BIT, RuntimeEnv};

/// Out-of-line continuation of an inline safepoint poll.
///
/// The inline check branches here when a suspend request is pending. The
/// stub publishes the poll instruction's address to the thread's resume
/// slot and tail-jumps into the shared safepoint handler; control never
/// falls through, and the handler later resumes execution at the published
/// address by its own mechanism.
#[derive(Debug)]
pub struct SafepointPollStub {
    entry: Label,
    safepoint_offset: CodeOffset,
}

impl SafepointPollStub {
    /// Creates a stub for the poll instruction at `safepoint_offset` within
    /// the current buffer.
    pub fn new(entry: Label, safepoint_offset: CodeOffset) -> Self {
        Self {
            entry,
            safepoint_offset,
        }
    }

    /// The label the inline poll branches to.
    pub fn entry(&self) -> Label {
        self.entry
    }

    /// Worst case: 7-byte lea, 7-byte store, 10-byte address
    /// materialization, 3-byte indirect jump, and slack.
    pub fn max_size(&self) -> usize {
        32
    }

    fn emit(&self, asm: &mut Assembler, env: &RuntimeEnv) {
        asm.bind_label(self.entry);
        let tmp = regs::scratch();
        // The poll instruction's address is derivable only now, from the
        // final distance between it and this stub.
        asm.lea_pc_rel(self.safepoint_offset, tmp);
        asm.mov_rm(
            tmp,
            &Amode::imm_reg(env.thread.resume_pc_offset, regs::thread()),
            OperandSize::S64,
        );
        asm.mov_ir(env.routines.safepoint_handler.as_u64(), tmp);
        asm.jmp_r(tmp);
    }
}

/// Out-of-line dispatch to the shared method entry barrier.
///
/// The inline guard at a method entry branches here when the compiled code
/// may be stale. The stub calls the barrier routine and resumes at the
/// continuation as if the barrier had run inline. The routine may
/// invalidate the very code executing it; the surrounding code-replacement
/// protocol tolerates that, and this stub only dispatches and resumes.
#[derive(Debug)]
pub struct EntryBarrierStub {
    entry: Label,
    continuation: Label,
}

impl EntryBarrierStub {
    /// Creates a stub dispatching to the entry barrier routine.
    pub fn new(entry: Label, continuation: Label) -> Self {
        Self {
            entry,
            continuation,
        }
    }

    /// The label the inline guard branches to.
    pub fn entry(&self) -> Label {
        self.entry
    }

    /// The main-body label resumed after the barrier returns.
    pub fn continuation(&self) -> Label {
        self.continuation
    }

    /// Worst case: 10-byte address materialization, 3-byte indirect call,
    /// 5-byte jump, and slack.
    pub fn max_size(&self) -> usize {
        20
    }

    fn emit(&self, asm: &mut Assembler, env: &RuntimeEnv) {
        asm.bind_label(self.entry);
        let tmp = regs::scratch();
        asm.mov_ir(env.routines.entry_barrier.as_u64(), tmp);
        asm.call_r(tmp);
        asm.jmp_label(self.continuation);
    }
}

/// Slow-path fallback of the lightweight-unlock fast path.
///
/// The inline fast path pops the thread's lock stack optimistically: it
/// decrements the top offset by one slot and only then verifies that the
/// popped slot held the object being unlocked. When the verification fails
/// (a nested or out-of-order unlock, or an inflated monitor) it branches
/// here with the accounting off by one slot. The stub restores the top
/// offset to its pre-attempt value and hands over to the shared slow-path
/// continuation, which performs the full unlock.
#[derive(Debug)]
pub struct FastUnlockLightweightStub {
    entry: Label,
    continuation: Label,
    obj: Gpr,
    tmp: Gpr,
    debug_checks: bool,
}

impl FastUnlockLightweightStub {
    /// Creates the stub. `obj` holds the object reference being unlocked
    /// and `tmp` is free for the stub to clobber. `debug_checks` selects
    /// the self-validating emission sequence.
    pub fn new(entry: Label, continuation: Label, obj: Gpr, tmp: Gpr, debug_checks: bool) -> Self {
        Self {
            entry,
            continuation,
            obj,
            tmp,
            debug_checks,
        }
    }

    /// The push-and-slow-path label the inline fast path branches to.
    pub fn entry(&self) -> Label {
        self.entry
    }

    /// The shared slow-path continuation in the main body.
    pub fn continuation(&self) -> Label {
        self.continuation
    }

    /// Worst case across both emission sequences. Generous: the longer,
    /// self-validating sequence stays under 32 bytes.
    pub fn max_size(&self) -> usize {
        128
    }

    fn emit(&self, asm: &mut Assembler, env: &RuntimeEnv) {
        let top = Amode::imm_reg(env.thread.lock_stack_top_offset, regs::thread());
        asm.bind_label(self.entry);
        if self.debug_checks {
            // Put the object back into the slot the fast path popped it
            // from; the slow path re-walks the lock stack and must see it.
            asm.mov_mr(&top, self.tmp, OperandSize::S32);
            asm.mov_rm(
                self.obj,
                &Amode::imm_reg_reg_shift(0, regs::thread(), self.tmp, 0),
                OperandSize::S64,
            );
        }
        // Undo the optimistic pop. This never overflows the fixed lock
        // stack capacity, and the flags it sets are not consumed.
        asm.add_im(LOCK_SLOT_BYTES, &top, OperandSize::S32);
        asm.jmp_label(self.continuation);
    }
}

/// Any out-of-line stub, dispatched by kind at emission time.
///
/// The set of kinds is closed and known when the compiler is built; adding
/// a kind means adding a variant here and an arm to each match below.
#[derive(Debug)]
pub enum Stub {
    /// See [`SafepointPollStub`].
    SafepointPoll(SafepointPollStub),
    /// See [`EntryBarrierStub`].
    EntryBarrier(EntryBarrierStub),
    /// See [`FastUnlockLightweightStub`].
    FastUnlockLightweight(FastUnlockLightweightStub),
}

impl Stub {
    /// The stub's entry label, the branch target planted in the main body.
    pub fn entry(&self) -> Label {
        match self {
            Stub::SafepointPoll(s) => s.entry(),
            Stub::EntryBarrier(s) => s.entry(),
            Stub::FastUnlockLightweight(s) => s.entry(),
        }
    }

    /// A conservative upper bound on the emitted size, in bytes: always at
    /// least what `emit` produces for this stub, deterministic given the
    /// stub's construction-time configuration.
    pub fn max_size(&self) -> usize {
        match self {
            Stub::SafepointPoll(s) => s.max_size(),
            Stub::EntryBarrier(s) => s.max_size(),
            Stub::FastUnlockLightweight(s) => s.max_size(),
        }
    }

    fn emit(&self, asm: &mut Assembler, env: &RuntimeEnv) {
        match self {
            Stub::SafepointPoll(s) => s.emit(asm, env),
            Stub::EntryBarrier(s) => s.emit(asm, env),
            Stub::FastUnlockLightweight(s) => s.emit(asm, env),
        }
    }
}

impl From<SafepointPollStub> for Stub {
    fn from(stub: SafepointPollStub) -> Self {
        Stub::SafepointPoll(stub)
    }
}

impl From<EntryBarrierStub> for Stub {
    fn from(stub: EntryBarrierStub) -> Self {
        Stub::EntryBarrier(stub)
    }
}

impl From<FastUnlockLightweightStub> for Stub {
    fn from(stub: FastUnlockLightweightStub) -> Self {
        Stub::FastUnlockLightweight(stub)
    }
}

/// Collects stubs requested during main-body generation and emits them in
/// a second pass.
pub struct StubSet {
    env: RuntimeEnv,
    stubs: SmallVec<[Stub; 4]>,
}

impl StubSet {
    /// Creates an empty set emitting against the given runtime context.
    pub fn new(env: RuntimeEnv) -> Self {
        Self {
            env,
            stubs: SmallVec::new(),
        }
    }

    /// The runtime context stubs will be emitted against.
    pub fn env(&self) -> &RuntimeEnv {
        &self.env
    }

    /// Queues a stub for the second emission pass.
    pub fn request(&mut self, stub: impl Into<Stub>) {
        self.stubs.push(stub.into());
    }

    /// The number of queued stubs.
    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    /// Whether no stubs have been requested.
    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }

    /// Worst-case total size of the queued stubs, for sizing a layout
    /// before any stub bytes exist.
    pub fn max_size(&self) -> usize {
        self.stubs.iter().map(Stub::max_size).sum()
    }

    /// Appends every queued stub to `asm`, in request order with no
    /// overlap. Each stub binds its entry label at its first byte and may
    /// reference only labels bound by the main body or by stubs emitted
    /// before it. A stub emitting past its declared maximum would corrupt
    /// the layout of everything after it; that is an emission-sequence
    /// defect, checked here.
    pub fn emit(self, asm: &mut Assembler) {
        for stub in &self.stubs {
            let start = asm.cur_offset();
            stub.emit(asm, &self.env);
            let emitted = asm.cur_offset() - start;
            trace!("StubSet: emitted {stub:?} at {start:#x}+{emitted}");
            debug_assert!(
                emitted as usize <= stub.max_size(),
                "stub emitted {emitted} bytes, over its declared maximum {}",
                stub.max_size(),
            );
            debug_assert_eq!(asm.buffer().label_offset(stub.entry()), Some(start));
        }
    }
}

/// Emits the inline safepoint poll: a test of the thread's poll word and a
/// conditional branch out to `entry`, the matching [`SafepointPollStub`]'s
/// entry label. Returns the offset of the poll instruction, which that
/// stub publishes as the thread's resume address.
pub fn emit_safepoint_poll(asm: &mut Assembler, env: &RuntimeEnv, entry: Label) -> CodeOffset {
    let poll_offset = asm.cur_offset();
    asm.testb_mi(
        POLL_BIT,
        &Amode::imm_reg(env.thread.poll_word_offset, regs::thread()),
    );
    asm.jcc_label(CC::NZ, entry);
    poll_offset
}

/// Emits the inline method entry guard: compares the thread's guard word
/// against `disarmed_value` and branches to the stub when they differ. The
/// stub's continuation label is bound immediately after the check.
pub fn emit_entry_barrier_check(
    asm: &mut Assembler,
    env: &RuntimeEnv,
    disarmed_value: i32,
    stub: &EntryBarrierStub,
) {
    asm.cmp_im(
        disarmed_value,
        &Amode::imm_reg(env.thread.guard_word_offset, regs::thread()),
        OperandSize::S32,
    );
    asm.jcc_label(CC::NZ, stub.entry());
    asm.bind_label(stub.continuation());
}
