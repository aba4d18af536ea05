//! # Code
//!
//! Instruction-level helpers for the architectures we patch

pub mod x64;
