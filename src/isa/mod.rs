//! Target-specific code generation support.
//!
//! Only x86-64 is implemented; the stub emission sequences and their size
//! bounds are encoding-specific, so a new target supplies its own module
//! here and recomputes the bounds from its worst-case instruction lengths.

pub mod x64;
