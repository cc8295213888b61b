//! EVM2 Backend — AArch64 instruction encoding and executable memory.
//!
//! `aarch64` holds the pure word encoders for the host instruction
//! forms the translator emits; `image` owns the mmap'd code page with
//! W^X discipline and instruction-cache maintenance.

pub mod aarch64;
pub mod image;

pub use image::{EntryFn, ExecImage};
