//! # View
//!
//! Bounded window over mapped memory. Every read is checked against the declared range,
//! so computed addresses from the image never get dereferenced blindly.

use std::marker::PhantomData;
use std::slice;

use thiserror::Error;

/// Errors when reading through a [`MemoryView`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ViewError {
    /// Requested range is not fully inside the view
    #[error("{len} byte(s) at {address:#X} lie outside the view")]
    OutOfBounds {
        /// Start of the requested range
        address: usize,
        /// Length of the requested range
        len: usize,
    },
    /// Address arithmetic wrapped around the address space
    #[error("address arithmetic overflowed")]
    AddressOverflow,
}

/// A `(base, len)` window over memory that is mapped for the lifetime `'a`
#[derive(Debug, Clone, Copy)]
pub struct MemoryView<'a> {
    /// First address of the window
    base: usize,
    /// Number of readable bytes from `base`
    len: usize,
    /// Ties the view to whatever keeps the memory mapped
    _marker: PhantomData<&'a [u8]>,
}

impl<'a> MemoryView<'a> {
    /// Creates a view over arbitrary memory, such as a loaded module image.
    ///
    /// # Safety
    ///
    /// `base..base + len` must be mapped and readable for all of `'a`.
    pub unsafe fn from_raw_parts(base: usize, len: usize) -> Self {
        Self {
            base,
            len,
            _marker: PhantomData,
        }
    }

    /// Creates a view over a slice.
    ///
    /// Intended for read-only use. Patching through a view built this way writes to memory Rust considers immutable.
    pub fn from_slice(data: &'a [u8]) -> Self {
        Self {
            base: data.as_ptr() as usize,
            len: data.len(),
            _marker: PhantomData,
        }
    }

    /// First address of the view
    pub fn base(&self) -> usize {
        self.base
    }

    /// Length of the view in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the view covers no memory
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last address of the view
    pub fn end(&self) -> usize {
        self.base + self.len
    }

    /// Checks that `address..address + len` is inside the view
    pub fn check(&self, address: usize, len: usize) -> Result<(), ViewError> {
        let out = ViewError::OutOfBounds { address, len };
        let start = address.checked_sub(self.base).ok_or(out)?;
        let end = start.checked_add(len).ok_or(out)?;
        if end > self.len {
            return Err(out);
        }
        Ok(())
    }

    /// Offset of `address` from the base of the view
    pub fn offset_of(&self, address: usize) -> Result<usize, ViewError> {
        self.check(address, 0)?;
        Ok(address - self.base)
    }

    /// Applies a signed displacement to an address without wrapping
    pub fn displace(address: usize, displacement: isize) -> Result<usize, ViewError> {
        address
            .checked_add_signed(displacement)
            .ok_or(ViewError::AddressOverflow)
    }

    /// Borrows `len` bytes starting at `address`
    pub fn bytes(&self, address: usize, len: usize) -> Result<&'a [u8], ViewError> {
        self.check(address, len)?;
        // Safety: the range was just checked against the view, which is mapped for `'a`
        Ok(unsafe { slice::from_raw_parts(address as *const u8, len) })
    }

    /// Borrows the whole view
    pub fn as_bytes(&self) -> &'a [u8] {
        // Safety: the view is mapped for `'a` by construction
        unsafe { slice::from_raw_parts(self.base as *const u8, self.len) }
    }

    /// Reads one byte
    pub fn read_u8(&self, address: usize) -> Result<u8, ViewError> {
        self.check(address, 1)?;
        // Safety: bounds checked above
        Ok(unsafe { (address as *const u8).read_volatile() })
    }

    /// Reads a little-endian `u16`
    pub fn read_u16_le(&self, address: usize) -> Result<u16, ViewError> {
        let bytes = self.bytes(address, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Reads a little-endian `u32`
    pub fn read_u32_le(&self, address: usize) -> Result<u32, ViewError> {
        let bytes = self.bytes(address, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a little-endian `i32`, unaligned reads allowed
    pub fn read_i32_le(&self, address: usize) -> Result<i32, ViewError> {
        let bytes = self.bytes(address, 4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads bytes up to (not including) a zero terminator.
    ///
    /// Returns `Ok(None)` when no terminator shows up within `max` bytes or before the view ends.
    /// Only a start address outside the view is an error.
    pub fn read_until_nul(
        &self,
        address: usize,
        max: usize,
    ) -> Result<Option<&'a [u8]>, ViewError> {
        self.check(address, 0)?;
        let available = self.end() - address;
        let window = self.bytes(address, available.min(max))?;

        Ok(window.iter().position(|b| *b == 0).map(|end| &window[..end]))
    }

    /// Hands out a writable pointer to a byte inside the view.
    ///
    /// The pointer is only bounds-checked; write permission is up to the patcher.
    pub fn pointer(&self, address: usize) -> Result<*mut u8, ViewError> {
        self.check(address, 1)?;
        Ok(address as *mut u8)
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryView, ViewError};

    #[test]
    /// Reads inside the view succeed, anything touching the edge fails
    fn test_bounds() {
        let data = [1u8, 2, 3, 4, 5, 6];
        let view = MemoryView::from_slice(&data);
        let base = view.base();

        assert_eq!(view.len(), 6);
        assert_eq!(view.read_u8(base).unwrap(), 1);
        assert_eq!(view.read_u8(base + 5).unwrap(), 6);
        assert_eq!(
            view.read_u8(base + 6),
            Err(ViewError::OutOfBounds {
                address: base + 6,
                len: 1
            })
        );
        assert!(view.read_u8(base - 1).is_err());
        assert!(view.bytes(base + 4, 3).is_err());
        assert_eq!(view.bytes(base + 4, 2).unwrap(), [5, 6]);
        assert!(view.check(base + 6, 0).is_ok());
        assert!(view.check(usize::MAX, 2).is_err());
        assert!(view.pointer(base + 6).is_err());
    }

    #[test]
    /// Displacements are little-endian and signed
    fn test_read_i32() {
        let data = [0xFCu8, 0xFF, 0xFF, 0xFF, 0x10, 0x00, 0x00, 0x00];
        let view = MemoryView::from_slice(&data);

        assert_eq!(view.read_i32_le(view.base()).unwrap(), -4);
        assert_eq!(view.read_i32_le(view.base() + 4).unwrap(), 0x10);
        assert!(view.read_i32_le(view.base() + 5).is_err());
    }

    #[test]
    /// Terminator search honours both the cap and the end of the view
    fn test_read_until_nul() {
        let data = *b"ABC\0DEFG";
        let view = MemoryView::from_slice(&data);
        let base = view.base();

        assert_eq!(view.read_until_nul(base, 256).unwrap(), Some(&b"ABC"[..]));
        assert_eq!(view.read_until_nul(base + 3, 256).unwrap(), Some(&b""[..]));
        // cap hit before the terminator
        assert_eq!(view.read_until_nul(base, 2).unwrap(), None);
        // view ends before the terminator or the cap
        assert_eq!(view.read_until_nul(base + 4, 256).unwrap(), None);
        assert_eq!(view.read_until_nul(view.end(), 256).unwrap(), None);
        assert!(view.read_until_nul(view.end() + 1, 256).is_err());
    }

    #[test]
    /// Signed displacement never wraps
    fn test_displace() {
        assert_eq!(MemoryView::displace(0x1000, -0x10).unwrap(), 0xFF0);
        assert_eq!(MemoryView::displace(0x1000, 0x10).unwrap(), 0x1010);
        assert_eq!(MemoryView::displace(5, -6), Err(ViewError::AddressOverflow));
    }
}
