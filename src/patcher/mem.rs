//! This module contains a patcher which adjusts memory permissions to patch read-only code

use region::Protection;
use thiserror::Error;

use super::{PatchOp, PatchOutcome, Patcher};

/// Errors when using permission patching
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// Error when querying or setting memory protections
    #[error("Error changing memory protection: {0}")]
    ProtectionChangeFailure(#[from] region::Error),
    /// Custom error type from the underlying patcher
    #[error("{0}")]
    CustomError(E),
}

/// This struct wraps patchers to allow them to write to memory that's normally unwritable.
/// It achieves this result by changing the memory permissions of the target page, triggering the patch, and then reverting the permissions.
///
/// The original permissions are restored on every path out of [`Patcher::patch`], including when the wrapped patcher fails.
///
/// # Safety
///
/// `PermissionWrapper` only unlocks the single byte at `op.target`,
/// pairing `PermissionWrapper` with a patcher that writes anywhere else is undefined behavior.
///
/// No other threads are paused. Code on the page may execute concurrently with the write.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissionWrapper<P: Patcher> {
    /// Underlying patcher.
    patcher: P,
}
impl<P: Patcher> PermissionWrapper<P> {
    /// Creates a new PermissionWrapper
    pub fn new(patcher: P) -> Self {
        Self { patcher }
    }
}

unsafe impl<P: Patcher> Patcher for PermissionWrapper<P> {
    type Error = PermissionError<P::Error>;

    unsafe fn patch(&self, mut op: PatchOp) -> Result<PatchOutcome, Self::Error> {
        op.protection = Some(region::query(op.target)?.protection());

        // the guard puts the old protection back when it goes out of scope, whatever the patcher returns
        let _guard = region::protect_with_handle(op.target, 1, Protection::READ_WRITE_EXECUTE)?;
        self.patcher
            .patch(op)
            .map_err(PermissionError::CustomError)
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use region::Protection;

    use crate::patcher::byte::OpcodePatcher;
    use crate::patcher::mem::{PermissionError, PermissionWrapper};
    use crate::patcher::{PatchOp, PatchOutcome, Patcher};
    use crate::testing::TestImage;

    /// Patcher that always fails without touching memory
    struct FailingPatcher;
    unsafe impl Patcher for FailingPatcher {
        type Error = &'static str;

        unsafe fn patch(&self, _op: PatchOp) -> Result<PatchOutcome, Self::Error> {
            Err("injected failure")
        }
    }

    #[test]
    /// Tests to ensure permissions are set for the write and reverted afterwards
    fn test_perms() {
        // Read-only code page. Normally, writing to it would segfault,
        // but PermissionWrapper changes the permissions to be writable so that no fault occurs
        let image = TestImage::new(&[0x90, 0x7E, 0x01, 0x90], Protection::READ_EXECUTE);

        // sanity check
        assert_eq!(image.bytes(), [0x90, 0x7E, 0x01, 0x90]);
        assert_eq!(image.protection(), Protection::READ_EXECUTE);

        // create the patcher and wrapper
        let wrapper = PermissionWrapper::new(OpcodePatcher::new());

        // patch the jle
        let op = PatchOp::new(image.pointer(1), 0xEB);
        let outcome = unsafe { wrapper.patch(op).unwrap() };

        // make sure the data was actually changed
        assert_eq!(image.bytes(), [0x90, 0xEB, 0x01, 0x90]);
        assert_eq!(outcome.original, 0x7E);
        assert!(outcome.changed);
        assert_eq!(outcome.protection, Some(Protection::READ_EXECUTE));

        // make sure permissions reverted correctly after the patch
        assert_eq!(image.protection(), Protection::READ_EXECUTE);
    }

    #[test]
    /// Second application of the same patch changes nothing and does not error
    fn test_idempotent() {
        let image = TestImage::new(&[0x75, 0x10], Protection::READ);
        let wrapper = PermissionWrapper::new(OpcodePatcher::new());

        let first = unsafe { wrapper.patch(PatchOp::new(image.pointer(0), 0xEB)).unwrap() };
        let after_first = image.bytes();
        let second = unsafe { wrapper.patch(PatchOp::new(image.pointer(0), 0xEB)).unwrap() };

        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(image.bytes(), after_first);
        assert_eq!(image.protection(), Protection::READ);
    }

    #[test]
    /// Protection is restored when the wrapped patcher fails
    fn test_perms_restored_on_failure() {
        let image = TestImage::new(&[0x7E, 0x01], Protection::READ_EXECUTE);
        let wrapper = PermissionWrapper::new(FailingPatcher);

        let result = unsafe { wrapper.patch(PatchOp::new(image.pointer(0), 0xEB)) };

        assert!(matches!(
            result,
            Err(PermissionError::CustomError("injected failure"))
        ));
        assert_eq!(image.bytes(), [0x7E, 0x01]);
        assert_eq!(image.protection(), Protection::READ_EXECUTE);
    }

    #[test]
    /// Protection changes the environment refuses surface as errors
    fn test_protection_failure() {
        let wrapper = PermissionWrapper::new(OpcodePatcher::new());

        let result = unsafe { wrapper.patch(PatchOp::new(ptr::null_mut(), 0xEB)) };

        assert!(matches!(
            result,
            Err(PermissionError::ProtectionChangeFailure(_))
        ));
    }
}
