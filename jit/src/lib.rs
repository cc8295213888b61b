//! EVM2 JIT — single-pass lowering of decoded instructions to
//! AArch64 machine code.
//!
//! The translator walks the instruction list once, emitting native
//! code through the backend encoders while building the translation
//! map (source bit offset → native instruction index). Forward
//! branch, call and thread-entry references are resolved by a final
//! fixup pass that patches the already-emitted words.

pub mod host;
pub mod translate;

pub use host::HostInterface;
pub use translate::{translate, TranslateError, TranslatedCode, ENTRY_BASE};
