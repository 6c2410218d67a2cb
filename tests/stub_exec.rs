//! Executes emitted stubs against a fake thread block.
//!
//! Each test assembles a small method body plus its stubs, maps the bytes
//! into executable memory, and calls in through a trampoline that loads
//! the pinned thread register. Runtime routines are plain `extern "C"`
//! functions, so the stubs' indirect transfers land back in Rust and the
//! tests observe their side effects on the thread block.

#![cfg(all(target_arch = "x86_64", unix))]

use std::ffi::c_void;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use rustix::mm;

use capstan_codegen::buffer::{CodeOffset, Label};
use capstan_codegen::isa::x64::address::Amode;
use capstan_codegen::isa::x64::asm::{Assembler, OperandSize};
use capstan_codegen::isa::x64::regs;
use capstan_codegen::runtime::{
    CodeAddr, LOCK_SLOT_BYTES, POLL_BIT, RuntimeEnv, RuntimeRoutines, ThreadLayout,
};
use capstan_codegen::stub::{
    self, EntryBarrierStub, FastUnlockLightweightStub, SafepointPollStub, StubSet,
};

/// Stands in for the runtime's per-thread block. The emitted code
/// addresses it through the pinned thread register with the offsets
/// reported by `layout`.
#[repr(C)]
#[derive(Default)]
struct FakeThread {
    resume_pc: u64,
    poll_word: u64,
    guard_word: u32,
    lock_stack_top: u32,
    hits: u32,
    _pad: u32,
    lock_stack: [u64; 4],
}

impl FakeThread {
    fn layout() -> ThreadLayout {
        ThreadLayout {
            resume_pc_offset: mem::offset_of!(FakeThread, resume_pc) as i32,
            poll_word_offset: mem::offset_of!(FakeThread, poll_word) as i32,
            guard_word_offset: mem::offset_of!(FakeThread, guard_word) as i32,
            lock_stack_top_offset: mem::offset_of!(FakeThread, lock_stack_top) as i32,
        }
    }

    fn lock_stack_offset() -> i32 {
        mem::offset_of!(FakeThread, lock_stack) as i32
    }

    fn hits_offset() -> i32 {
        mem::offset_of!(FakeThread, hits) as i32
    }
}

static BARRIER_CALLS: AtomicUsize = AtomicUsize::new(0);
static UNLOCK_CALLS: AtomicUsize = AtomicUsize::new(0);

// Entered by a tail jump, so its `ret` returns to the trampoline.
extern "C" fn safepoint_handler_routine() {}

extern "C" fn barrier_routine() {
    BARRIER_CALLS.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn unlock_slow_routine() {
    UNLOCK_CALLS.fetch_add(1, Ordering::SeqCst);
}

fn addr_of(f: extern "C" fn()) -> CodeAddr {
    CodeAddr::new(f as usize as u64)
}

fn test_env() -> RuntimeEnv {
    RuntimeEnv::new(
        RuntimeRoutines {
            safepoint_handler: addr_of(safepoint_handler_routine),
            entry_barrier: addr_of(barrier_routine),
            unlock_slow_path: addr_of(unlock_slow_routine),
        },
        FakeThread::layout(),
    )
}

/// A page-granular executable mapping of finalized code.
struct ExecCode {
    ptr: NonNull<c_void>,
    len: usize,
}

impl ExecCode {
    fn map(code: &[u8]) -> Self {
        let len = code.len().div_ceil(4096).max(1) * 4096;
        unsafe {
            let ptr = mm::mmap_anonymous(
                ptr::null_mut(),
                len,
                mm::ProtFlags::READ | mm::ProtFlags::WRITE,
                mm::MapFlags::PRIVATE,
            )
            .expect("anonymous mapping");
            ptr::copy_nonoverlapping(code.as_ptr(), ptr.cast::<u8>(), code.len());
            mm::mprotect(ptr, len, mm::MprotectFlags::READ | mm::MprotectFlags::EXEC)
                .expect("make mapping executable");
            Self {
                ptr: NonNull::new(ptr).unwrap(),
                len,
            }
        }
    }

    fn base(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    unsafe fn invoke(&self, offset: CodeOffset) {
        let addr = self.base() + u64::from(offset);
        let f = unsafe { mem::transmute::<usize, extern "C" fn()>(addr as usize) };
        f();
    }
}

impl Drop for ExecCode {
    fn drop(&mut self) {
        unsafe {
            let _ = mm::munmap(self.ptr.as_ptr(), self.len);
        }
    }
}

/// Saves the pinned thread register, points it at the fake thread block,
/// and calls the method body.
fn emit_trampoline(asm: &mut Assembler, thread_addr: u64, body: Label) -> CodeOffset {
    let entry = asm.cur_offset();
    asm.push_r(regs::thread());
    asm.mov_ir(thread_addr, regs::thread());
    asm.call_label(body);
    asm.pop_r(regs::thread());
    asm.ret();
    entry
}

#[test]
fn safepoint_stub_records_resume_pc() -> Result<()> {
    let _ = env_logger::try_init();
    let mut thread = FakeThread {
        poll_word: u64::from(POLL_BIT),
        ..FakeThread::default()
    };

    let mut asm = Assembler::new();
    let mut set = StubSet::new(test_env());
    let body = asm.get_label();
    let sp_entry = asm.get_label();
    asm.bind_label(body);
    let poll_offset = stub::emit_safepoint_poll(&mut asm, set.env(), sp_entry);
    asm.ret();
    set.request(SafepointPollStub::new(sp_entry, poll_offset));
    set.emit(&mut asm);
    let tramp = emit_trampoline(&mut asm, &mut thread as *mut FakeThread as u64, body);

    let code = asm.finish()?;
    let exec = ExecCode::map(code.data());
    unsafe { exec.invoke(tramp) };

    // The stub ran and published the poll instruction's absolute address.
    assert_eq!(thread.resume_pc, exec.base() + u64::from(poll_offset));
    Ok(())
}

#[test]
fn safepoint_poll_falls_through_when_clear() -> Result<()> {
    let _ = env_logger::try_init();
    let mut thread = FakeThread::default();

    let mut asm = Assembler::new();
    let mut set = StubSet::new(test_env());
    let body = asm.get_label();
    let sp_entry = asm.get_label();
    asm.bind_label(body);
    let poll_offset = stub::emit_safepoint_poll(&mut asm, set.env(), sp_entry);
    asm.ret();
    set.request(SafepointPollStub::new(sp_entry, poll_offset));
    set.emit(&mut asm);
    let tramp = emit_trampoline(&mut asm, &mut thread as *mut FakeThread as u64, body);

    let code = asm.finish()?;
    let exec = ExecCode::map(code.data());
    unsafe { exec.invoke(tramp) };

    assert_eq!(thread.resume_pc, 0);
    Ok(())
}

#[test]
fn entry_barrier_stub_calls_barrier_once() -> Result<()> {
    let _ = env_logger::try_init();
    const DISARMED: i32 = 0;
    for (armed, expected_calls) in [(true, 1), (false, 0)] {
        BARRIER_CALLS.store(0, Ordering::SeqCst);
        let mut thread = FakeThread {
            guard_word: if armed { 1 } else { DISARMED as u32 },
            ..FakeThread::default()
        };

        let mut asm = Assembler::new();
        let mut set = StubSet::new(test_env());
        let body = asm.get_label();
        let eb_entry = asm.get_label();
        let eb_cont = asm.get_label();
        let barrier = EntryBarrierStub::new(eb_entry, eb_cont);
        asm.bind_label(body);
        // The push keeps rsp 16-byte aligned at the stub's call.
        asm.push_r(regs::rax());
        stub::emit_entry_barrier_check(&mut asm, set.env(), DISARMED, &barrier);
        asm.add_im(
            1,
            &Amode::imm_reg(FakeThread::hits_offset(), regs::thread()),
            OperandSize::S32,
        );
        asm.pop_r(regs::rax());
        asm.ret();
        set.request(barrier);
        set.emit(&mut asm);
        let tramp = emit_trampoline(&mut asm, &mut thread as *mut FakeThread as u64, body);

        let code = asm.finish()?;
        let exec = ExecCode::map(code.data());
        unsafe { exec.invoke(tramp) };

        assert_eq!(BARRIER_CALLS.load(Ordering::SeqCst), expected_calls);
        // Whether or not the stub ran, control resumed at the continuation
        // exactly once.
        assert_eq!(thread.hits, 1);
    }
    Ok(())
}

#[test]
fn fast_unlock_stub_restores_lock_stack_top() -> Result<()> {
    let _ = env_logger::try_init();
    const OBJ_SENTINEL: u64 = 0xdead_beef_cafe_f00d;
    for debug_checks in [false, true] {
        UNLOCK_CALLS.store(0, Ordering::SeqCst);
        // One lock was held; the inline fast path already popped it, so
        // the top offset sits one slot low when the stub takes over.
        let popped_top = FakeThread::lock_stack_offset() as u32;
        let mut thread = FakeThread {
            lock_stack_top: popped_top,
            ..FakeThread::default()
        };

        let mut asm = Assembler::new();
        let mut set = StubSet::new(test_env());
        let body = asm.get_label();
        let ul_entry = asm.get_label();
        let ul_cont = asm.get_label();
        asm.bind_label(body);
        // The push keeps rsp 16-byte aligned at the continuation's call.
        asm.push_r(regs::rax());
        asm.mov_ir(OBJ_SENTINEL, regs::rsi());
        asm.jmp_label(ul_entry);
        asm.bind_label(ul_cont);
        asm.mov_ir(set.env().routines.unlock_slow_path.as_u64(), regs::scratch());
        asm.call_r(regs::scratch());
        asm.add_im(
            1,
            &Amode::imm_reg(FakeThread::hits_offset(), regs::thread()),
            OperandSize::S32,
        );
        asm.pop_r(regs::rax());
        asm.ret();
        set.request(FastUnlockLightweightStub::new(
            ul_entry,
            ul_cont,
            regs::rsi(),
            regs::rax(),
            debug_checks,
        ));
        set.emit(&mut asm);
        let tramp = emit_trampoline(&mut asm, &mut thread as *mut FakeThread as u64, body);

        let code = asm.finish()?;
        let exec = ExecCode::map(code.data());
        unsafe { exec.invoke(tramp) };

        assert_eq!(
            thread.lock_stack_top,
            popped_top + LOCK_SLOT_BYTES as u32,
            "debug_checks={debug_checks}: top must return to its pre-attempt value",
        );
        if debug_checks {
            assert_eq!(thread.lock_stack[0], OBJ_SENTINEL);
        }
        assert_eq!(UNLOCK_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(thread.hits, 1);
    }
    Ok(())
}
