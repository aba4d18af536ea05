//! # Host
//!
//! Where the image to patch lives, and which build of it is running

use std::fmt::{self, Display};

use thiserror::Error;

use crate::view::{MemoryView, ViewError};

/// Errors while locating the host image
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The loader has no module by that name
    #[error("module not found")]
    ModuleNotFound,
    /// Headers of the mapped image do not parse
    #[error("invalid image headers: {0}")]
    InvalidImage(&'static str),
    /// Headers point outside the mapped image
    #[error(transparent)]
    View(#[from] ViewError),
}

/// Runtime version in the host's packed form: `major.minor.build.sub` as `MM mm bbb s`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuntimeVersion(pub u32);

impl RuntimeVersion {
    /// Packs a version the way the host's script extender does
    pub const fn new(major: u32, minor: u32, build: u32) -> Self {
        Self(((major & 0xFF) << 24) | ((minor & 0xFF) << 16) | ((build & 0xFFF) << 4))
    }

    /// Major component
    pub fn major(self) -> u32 {
        self.0 >> 24
    }

    /// Minor component
    pub fn minor(self) -> u32 {
        (self.0 >> 16) & 0xFF
    }

    /// Build component
    pub fn build(self) -> u32 {
        (self.0 >> 4) & 0xFFF
    }
}

impl Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:X} ({}.{}.{})",
            self.0,
            self.major(),
            self.minor(),
            self.build()
        )
    }
}

/// Build the shipped patterns were made against
pub const TARGET_RUNTIME: RuntimeVersion = RuntimeVersion::new(1, 7, 23);

/// The executable image being patched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostModule {
    /// File name of the image
    pub name: String,
    /// Load address
    pub base: usize,
    /// Mapped size in bytes
    pub size: usize,
    /// Detected runtime version, if the host reported one
    pub version: Option<RuntimeVersion>,
}

impl HostModule {
    /// View over the whole mapped image
    ///
    /// # Safety
    ///
    /// `base..base + size` must be mapped and readable for as long as the view is used
    pub unsafe fn view(&self) -> MemoryView<'_> {
        MemoryView::from_raw_parts(self.base, self.size)
    }

    /// Offset of `address` from the load address, for log lines
    pub fn offset_of(&self, address: usize) -> usize {
        address.wrapping_sub(self.base)
    }
}

/// Finds the image to patch
pub trait HostResolver {
    /// Locates the image and its version
    fn resolve(&self) -> Result<HostModule, ResolveError>;
}

/// Resolver for hosts that already know where the image is
#[derive(Debug, Clone)]
pub struct StaticHost(pub HostModule);

impl HostResolver for StaticHost {
    fn resolve(&self) -> Result<HostModule, ResolveError> {
        Ok(self.0.clone())
    }
}

/// `MZ`
const DOS_MAGIC: u16 = 0x5A4D;
/// `PE\0\0`
const NT_SIGNATURE: u32 = 0x0000_4550;
/// Offset of `e_lfanew` in the DOS header
const LFANEW_OFFSET: usize = 0x3C;
/// Signature plus file header
const OPTIONAL_HEADER_OFFSET: usize = 4 + 20;
/// `SizeOfImage` sits at the same offset for PE32 and PE32+
const SIZE_OF_IMAGE_OFFSET: usize = 56;

/// Reads `SizeOfImage` from the PE headers at the start of `headers`
pub fn image_size(headers: &MemoryView<'_>) -> Result<usize, ResolveError> {
    let base = headers.base();
    if headers.read_u16_le(base)? != DOS_MAGIC {
        return Err(ResolveError::InvalidImage("missing DOS signature"));
    }

    let lfanew = headers.read_i32_le(base + LFANEW_OFFSET)?;
    let nt = MemoryView::displace(base, lfanew as isize)?;
    if headers.read_u32_le(nt)? != NT_SIGNATURE {
        return Err(ResolveError::InvalidImage("missing NT signature"));
    }

    let size = headers.read_u32_le(nt + OPTIONAL_HEADER_OFFSET + SIZE_OF_IMAGE_OFFSET)?;
    if size == 0 {
        return Err(ResolveError::InvalidImage("zero image size"));
    }
    Ok(size as usize)
}

#[cfg(windows)]
pub use self::windows::MainModule;

#[cfg(windows)]
mod windows {
    use windows_sys::Win32::System::LibraryLoader::{GetModuleFileNameW, GetModuleHandleW};

    use super::{image_size, HostModule, HostResolver, ResolveError, RuntimeVersion};
    use crate::view::MemoryView;

    /// The executable of the current process
    #[derive(Debug, Clone, Copy, Default)]
    pub struct MainModule {
        /// Version reported by the host, detection is up to the caller
        version: Option<RuntimeVersion>,
    }

    impl MainModule {
        /// Creates a resolver for the process executable
        pub fn new(version: Option<RuntimeVersion>) -> Self {
            Self { version }
        }
    }

    impl HostResolver for MainModule {
        fn resolve(&self) -> Result<HostModule, ResolveError> {
            let handle = unsafe { GetModuleHandleW(std::ptr::null()) };
            let base = handle as usize;
            if base == 0 {
                return Err(ResolveError::ModuleNotFound);
            }

            let mut path = [0u16; 260];
            let len = unsafe { GetModuleFileNameW(handle, path.as_mut_ptr(), path.len() as u32) };
            let len = len as usize;
            let path = String::from_utf16_lossy(&path[..len.min(path.len())]);
            let name = path
                .rsplit(|c: char| c == '\\' || c == '/')
                .next()
                .unwrap_or_default()
                .to_owned();

            // Safety: the header page of a loaded image stays mapped while the image is loaded
            let headers = unsafe { MemoryView::from_raw_parts(base, region::page::size()) };
            let size = image_size(&headers)?;

            Ok(HostModule {
                name,
                base,
                size,
                version: self.version,
            })
        }
    }
}
