//! This module contains a single-byte opcode patcher

use std::convert::Infallible;

use super::{PatchOp, PatchOutcome, Patcher};

/// Patcher that overwrites one byte in place.
/// This patcher never fails, and never writes a byte that already holds the replacement.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpcodePatcher;
impl OpcodePatcher {
    /// Creates a new [`OpcodePatcher`]
    pub fn new() -> Self {
        Self::default()
    }
}
unsafe impl Patcher for OpcodePatcher {
    type Error = Infallible;

    unsafe fn patch(&self, op: PatchOp) -> Result<PatchOutcome, Self::Error> {
        // Safety: caller must pass in a `target` pointer that is valid for reads
        let original = op.target.read_volatile();
        let changed = original != op.replacement;

        if changed {
            // Safety: caller must ensure that `target` is writable
            op.target.write_volatile(op.replacement);
        }

        Ok(PatchOutcome {
            original,
            changed,
            protection: op.protection,
        })
    }
}
