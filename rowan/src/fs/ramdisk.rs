//! In-memory block device.
//!
//! The boot flow hands the kernel a filesystem image sitting somewhere
//! in RAM (loaded alongside the kernel); this wraps it with a
//! block-granular read interface so the filesystem layer never touches
//! raw memory itself.

use super::BLOCK_SIZE;
use crate::error::{Error, Result};

pub struct Ramdisk {
    data: &'static [u8],
}

impl Ramdisk {
    /// Wrap a static in-memory image.
    pub fn new(data: &'static [u8]) -> Self {
        Self { data }
    }

    /// Wrap a raw RAM region.
    ///
    /// # Safety
    ///
    /// The region must stay valid and unmodified for the kernel's
    /// lifetime.
    pub unsafe fn from_raw(base: usize, len: usize) -> Self {
        Self {
            data: core::slice::from_raw_parts(base as *const u8, len),
        }
    }

    pub fn block_count(&self) -> usize {
        self.data.len() / BLOCK_SIZE
    }

    pub fn read_block(&self, index: usize, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        let start = index.checked_mul(BLOCK_SIZE).ok_or(Error::Io)?;
        let end = start.checked_add(BLOCK_SIZE).ok_or(Error::Io)?;
        if end > self.data.len() {
            return Err(Error::Io);
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }
}
