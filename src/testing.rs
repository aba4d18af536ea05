//! Fake module images for the unit tests

use std::ptr;

use region::{Allocation, Protection};

use crate::view::MemoryView;

/// Bytes copied into freshly mapped pages with a chosen protection
pub struct TestImage {
    /// Backing pages
    alloc: Allocation,
    /// Number of meaningful bytes at the start of `alloc`
    len: usize,
}

impl TestImage {
    /// Maps `bytes` and then drops the pages to `protection`
    pub fn new(bytes: &[u8], protection: Protection) -> Self {
        let mut alloc = region::alloc(bytes.len().max(1), Protection::READ_WRITE).unwrap();
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), alloc.as_mut_ptr::<u8>(), bytes.len());
            region::protect(alloc.as_ptr::<u8>(), alloc.len(), protection).unwrap();
        }
        Self {
            alloc,
            len: bytes.len(),
        }
    }

    /// Address of the first byte
    pub fn base(&self) -> usize {
        self.alloc.as_ptr::<u8>() as usize
    }

    /// Pointer to the byte at `offset`
    pub fn pointer(&self, offset: usize) -> *mut u8 {
        assert!(offset < self.len);
        (self.base() + offset) as *mut u8
    }

    /// View over the meaningful bytes
    pub fn view(&self) -> MemoryView<'_> {
        unsafe { MemoryView::from_raw_parts(self.base(), self.len) }
    }

    /// Snapshot of the meaningful bytes
    pub fn bytes(&self) -> Vec<u8> {
        self.view().as_bytes().to_vec()
    }

    /// Current protection of the first page
    pub fn protection(&self) -> Protection {
        region::query(self.alloc.as_ptr::<u8>()).unwrap().protection()
    }
}

/// Encodes one limit check as it appears in the target: `jcc +1`, the message `lea`,
/// `lea rcx, [rbp + tail]`, then the length-prefixed identifier the message `lea` points at
pub fn limit_check(opcode: u8, tail: u8, identifier: &str) -> Vec<u8> {
    let mut code = vec![opcode, 0x01, 0x48, 0x8D, 0x15];
    // the lea ends at +9 and targets the length prefix at +13
    code.extend_from_slice(&4i32.to_le_bytes());
    code.extend_from_slice(&[0x48, 0x8D, 0x4D, tail]);
    code.push(identifier.len() as u8);
    code.extend_from_slice(identifier.as_bytes());
    code.push(0);
    code
}
