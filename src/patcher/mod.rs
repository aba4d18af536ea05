//! # Patch
//!
//! This module covers patchers, which overwrite a single opcode byte in memory

use region::Protection;

pub mod byte;
pub mod mem;

/// A pending rewrite of one byte.
///
/// Built for each validated site and consumed by exactly one [`Patcher::patch`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchOp {
    /// Byte to overwrite
    pub target: *mut u8,
    /// Value to write at `target`
    pub replacement: u8,
    /// Protection of the containing page before the patch, once known
    pub protection: Option<Protection>,
}
impl PatchOp {
    /// Creates a new op with unknown page protection
    pub fn new(target: *mut u8, replacement: u8) -> Self {
        Self {
            target,
            replacement,
            protection: None,
        }
    }
}

/// What a patch did to its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchOutcome {
    /// Byte found at the target before the patch
    pub original: u8,
    /// Whether the byte was actually written. `false` when it already held the replacement.
    pub changed: bool,
    /// Page protection observed before the patch, if a wrapper recorded it
    pub protection: Option<Protection>,
}

/// Writes [`PatchOp`]s to memory
///
/// # Safety
///
/// Patchers are inherently unsafe. The implementor must ensure that the implementation of `patch` touches nothing but `op.target`
pub unsafe trait Patcher {
    /// Error type that can occur when patching. If patching always succeeds, use [`std::convert::Infallible`].
    type Error;

    /// Applies `op`.
    ///
    /// # Safety
    ///
    /// `op.target` must be valid for reads, and for writes as far as the specific patcher requires
    unsafe fn patch(&self, op: PatchOp) -> Result<PatchOutcome, Self::Error>;
}
