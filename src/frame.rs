// SPDX-License-Identifier: MPL-2.0

//! Physical frame objects that back virtual memory mappings.

use spin::Mutex;

use crate::{
    mm::{Paddr, PAGE_SIZE},
    prelude::*,
};

/// A shareable container of physical pages.
///
/// A frame is shared across address spaces through `Arc`; every mapping that
/// exposes a window of the frame owns one reference.
///
/// # Thread safety
///
/// `VmFrame` is a data structure of interior mutability. Implementations
/// serialize their page bookkeeping behind their own lock; callers may invoke
/// any operation concurrently from multiple threads.
pub trait VmFrame: Send + Sync {
    /// Returns the number of pages in the frame.
    fn page_count(&self) -> usize;

    /// Reads bytes at `offset` into `buf`.
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` at `offset`.
    fn write(&self, offset: usize, buf: &[u8]) -> Result<()>;

    /// Returns the physical address of the page backing the logical page
    /// `page_idx`.
    ///
    /// `write_intent` tells the frame that the caller is about to install a
    /// writable translation; a copy-on-write frame forks the page at this
    /// point.
    fn page_hit(&self, page_idx: usize, write_intent: bool) -> Result<Paddr>;
}

/// A frame backed by an ordinary memory buffer.
///
/// `page_hit` hands out synthetic physical addresses starting at the base
/// the frame was created with, so the frame can pair with a software page
/// table. No copy-on-write: `write_intent` is accepted and ignored.
#[derive(Debug)]
pub struct MemFrame {
    pages: Mutex<Vec<u8>>,
    base_paddr: Paddr,
}

impl MemFrame {
    /// Creates a frame of `num_pages` pages whose page 0 reports the
    /// physical address `base_paddr`.
    pub fn create(num_pages: usize, base_paddr: Paddr) -> Result<Self> {
        if num_pages == 0 || base_paddr % PAGE_SIZE != 0 {
            return_errno_with_msg!(Errno::InvalidArgs, "bad frame geometry");
        }
        Ok(Self {
            pages: Mutex::new(vec![0; num_pages * PAGE_SIZE]),
            base_paddr,
        })
    }
}

impl VmFrame for MemFrame {
    fn page_count(&self) -> usize {
        self.pages.lock().len() / PAGE_SIZE
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let pages = self.pages.lock();
        let end = offset
            .checked_add(buf.len())
            .ok_or(Error::with_msg(Errno::OutOfBounds, "frame read wraps around"))?;
        if end > pages.len() {
            return_errno_with_msg!(Errno::OutOfBounds, "read position is out of range");
        }
        buf.copy_from_slice(&pages[offset..end]);
        Ok(())
    }

    fn write(&self, offset: usize, buf: &[u8]) -> Result<()> {
        let mut pages = self.pages.lock();
        let end = offset
            .checked_add(buf.len())
            .ok_or(Error::with_msg(Errno::OutOfBounds, "frame write wraps around"))?;
        if end > pages.len() {
            return_errno_with_msg!(Errno::OutOfBounds, "write position is out of range");
        }
        pages[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn page_hit(&self, page_idx: usize, _write_intent: bool) -> Result<Paddr> {
        if page_idx >= self.page_count() {
            return_errno_with_msg!(Errno::OutOfBounds, "page index is outside the frame");
        }
        Ok(self.base_paddr + page_idx * PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_frame() {
        let frame = MemFrame::create(4, 0x4000).unwrap();
        assert_eq!(frame.page_count(), 4);

        frame.write(PAGE_SIZE - 2, &[7u8; 4]).unwrap();
        let mut buf = [0u8; 8];
        frame.read(PAGE_SIZE - 4, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 7, 7, 7, 7, 0, 0]);

        assert_eq!(frame.page_hit(0, false).unwrap(), 0x4000);
        assert_eq!(frame.page_hit(3, true).unwrap(), 0x7000);
        assert_eq!(
            frame.page_hit(4, false).unwrap_err().errno(),
            Errno::OutOfBounds
        );
    }

    #[test]
    fn mem_frame_rejects_out_of_range_io() {
        let frame = MemFrame::create(1, 0).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(
            frame.read(PAGE_SIZE - 4, &mut buf).unwrap_err().errno(),
            Errno::OutOfBounds
        );
        assert_eq!(
            frame.write(usize::MAX, &buf).unwrap_err().errno(),
            Errno::OutOfBounds
        );
    }

    #[test]
    fn mem_frame_rejects_bad_geometry() {
        assert_eq!(
            MemFrame::create(0, 0).unwrap_err().errno(),
            Errno::InvalidArgs
        );
        assert_eq!(
            MemFrame::create(1, 0x123).unwrap_err().errno(),
            Errno::InvalidArgs
        );
    }
}
