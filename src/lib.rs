//! Out-of-line code stub emission for the Capstan baseline JIT.
//!
//! Compiled methods keep rarely-taken work out of the instruction stream
//! the fast path executes. During main-body generation each rare condition
//! plants a forward branch to an unbound label and queues a stub on a
//! [`stub::StubSet`]; after the body is complete, a second pass appends
//! every queued stub in request order, resolving the branches. Each stub
//! kind declares a conservative worst-case size so layout decisions can be
//! made before any stub bytes exist, and emission checks the actual size
//! against that bound.
//!
//! Stubs read thread state and dispatch to runtime routines through a
//! [`runtime::RuntimeEnv`] supplied by the embedder; nothing here assumes
//! a particular runtime beyond the field offsets and entry points it
//! describes.
//!
//! ```
//! use capstan_codegen::buffer::CodeError;
//! use capstan_codegen::isa::x64::asm::Assembler;
//! use capstan_codegen::runtime::{CodeAddr, RuntimeEnv, RuntimeRoutines, ThreadLayout};
//! use capstan_codegen::stub::{self, SafepointPollStub, StubSet};
//!
//! fn main() -> Result<(), CodeError> {
//!     let env = RuntimeEnv::new(
//!         RuntimeRoutines {
//!             safepoint_handler: CodeAddr::new(0x7f00_0000_1000),
//!             entry_barrier: CodeAddr::new(0x7f00_0000_2000),
//!             unlock_slow_path: CodeAddr::new(0x7f00_0000_3000),
//!         },
//!         ThreadLayout {
//!             resume_pc_offset: 0x10,
//!             poll_word_offset: 0x18,
//!             guard_word_offset: 0x20,
//!             lock_stack_top_offset: 0x24,
//!         },
//!     );
//!     let mut asm = Assembler::new();
//!     let mut stubs = StubSet::new(env);
//!
//!     // Main body: an inline poll, then the method's (trivial) work.
//!     let entry = asm.get_label();
//!     let poll_offset = stub::emit_safepoint_poll(&mut asm, stubs.env(), entry);
//!     stubs.request(SafepointPollStub::new(entry, poll_offset));
//!     asm.ret();
//!
//!     // Second pass: append every requested stub after the body.
//!     stubs.emit(&mut asm);
//!     let code = asm.finish()?;
//!     assert_eq!(code.total_size(), 36);
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod isa;
pub mod runtime;
pub mod stub;
