// SPDX-License-Identifier: MPL-2.0

//! Virtual memory address spaces.

pub(crate) mod mapping;
pub mod perms;

use core::{
    ops::Range,
    sync::atomic::{AtomicUsize, Ordering},
};

use align_ext::AlignExt;
use spin::Mutex;

use crate::{
    frame::VmFrame,
    hal::VmemHal,
    mm::{is_page_aligned, Paddr, Vaddr, LOWEST_USER_VADDR, MAX_USERSPACE_VADDR, PAGE_SIZE},
    prelude::*,
};

use self::{
    mapping::{MappingSet, VmMapping},
    perms::{VmMapFlags, VmPerms},
};

/// The cause of a user page fault, as decoded by the trap handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultCause {
    Read,
    Write,
    Exec,
}

/// One user address space: an ordered catalog of virtual-memory mappings
/// together with the hardware page-table root needed to install them on a
/// CPU.
///
/// Registering a mapping does not touch the hardware page table; entries are
/// materialized on first fault by [`Vmem::page_fault`], which both amortizes
/// the installation cost and keeps address spaces cheap to set up. `unmap`
/// does tear installed entries down eagerly, so a released frame is never
/// left reachable through a stale translation.
///
/// The object is shared by capability holders through `Arc`; dropping the
/// last handle releases every mapping's frame reference and the page-table
/// root.
///
/// [`Vmem::read`] and [`Vmem::write`] tunnel through the backing frames and
/// therefore work on address spaces that are not active on any CPU, which is
/// how the kernel moves data in and out of foreign processes.
pub struct Vmem<H: VmemHal> {
    hal: H,
    /// The page-table root, or 0 until `start` has allocated one. Published
    /// atomically so `switch_to` does not take the table lock.
    root: AtomicUsize,
    mappings: Mutex<MappingSet>,
}

impl<H: VmemHal> Vmem<H> {
    /// Creates an empty address space on the given hardware layer.
    pub fn new(hal: H) -> Arc<Self> {
        Arc::new(Self {
            hal,
            root: AtomicUsize::new(0),
            mappings: Mutex::new(MappingSet::new()),
        })
    }

    /// Returns the attached hardware layer.
    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// Allocates and publishes the hardware page-table root. A no-op if a
    /// root already exists.
    pub fn start(&self) -> Result<()> {
        let _guard = self.mappings.lock();
        if self.root.load(Ordering::Relaxed) != 0 {
            return Ok(());
        }
        let root = self.hal.alloc_root()?;
        trace!("start, root = {:#x}", root);
        self.root.store(root, Ordering::Release);
        Ok(())
    }

    /// Loads this address space's page-table root on the current CPU.
    ///
    /// # Panics
    ///
    /// Panics if [`Vmem::start`] has not allocated a root yet.
    pub fn switch_to(&self) {
        let root = self.root.load(Ordering::Acquire);
        assert!(
            root != 0,
            "switching to an address space that was never started"
        );
        self.hal.switch_to(root);
    }

    /// Registers a mapping of `num_pages` pages of `frame`, starting at
    /// frame page `frame_start`, and returns the virtual address it landed
    /// on.
    ///
    /// With [`VmMapFlags::FIXED`] the mapping is installed at exactly
    /// `vaddr`, displacing whatever overlaps it. Otherwise `vaddr` is a
    /// hint and the first free range large enough is used.
    ///
    /// The frame reference is consumed: on success the address space owns
    /// it, on failure it is released.
    ///
    /// # Panics
    ///
    /// Panics if `vaddr` is not page-aligned.
    pub fn map(
        &self,
        frame: Arc<dyn VmFrame>,
        frame_start: usize,
        vaddr: Vaddr,
        num_pages: usize,
        perms: VmPerms,
        flags: VmMapFlags,
    ) -> Result<Vaddr> {
        trace!(
            "map, vaddr = {:#x}, pages = {}, perms = {:?}, flags = {:?}",
            vaddr,
            num_pages,
            perms,
            flags
        );
        if num_pages == 0 {
            return_errno_with_msg!(Errno::InvalidArgs, "mapping size is zero");
        }
        assert!(
            is_page_aligned(vaddr),
            "the mapped address must be page-aligned"
        );
        let size = num_pages
            .checked_mul(PAGE_SIZE)
            .ok_or(Error::with_msg(Errno::OutOfBounds, "mapping size overflows"))?;
        let end = vaddr
            .checked_add(size)
            .ok_or(Error::with_msg(Errno::OutOfBounds, "mapping wraps around"))?;
        if end > MAX_USERSPACE_VADDR {
            return_errno_with_msg!(Errno::OutOfBounds, "mapping leaves user space");
        }
        let window_end = frame_start
            .checked_add(num_pages)
            .ok_or(Error::with_msg(Errno::OutOfBounds, "frame window overflows"))?;
        if window_end > frame.page_count() {
            return_errno_with_msg!(Errno::OutOfBounds, "frame window outside the frame");
        }

        let mapping = VmMapping::new(frame, frame_start, num_pages, vaddr, perms, flags);
        let mut mappings = self.mappings.lock();
        let addr = if flags.contains(VmMapFlags::FIXED) {
            place_fixed(&mut mappings, mapping)?
        } else {
            place_hint(&mut mappings, mapping)?
        };
        mappings.check_invariants();
        Ok(addr)
    }

    /// Removes `[vaddr, vaddr + num_pages * PAGE_SIZE)` from the address
    /// space. Records partially covered by the range are trimmed; a record
    /// strictly containing it is split in two around the hole. Installed
    /// hardware translations in the range are torn down eagerly.
    ///
    /// Unmapping an already-unmapped range is a no-op, so the operation is
    /// idempotent.
    ///
    /// # Panics
    ///
    /// Panics if `vaddr` is not page-aligned.
    pub fn unmap(&self, vaddr: Vaddr, num_pages: usize) -> Result<()> {
        trace!("unmap, vaddr = {:#x}, pages = {}", vaddr, num_pages);
        if num_pages == 0 {
            return Ok(());
        }
        assert!(
            is_page_aligned(vaddr),
            "the unmapped address must be page-aligned"
        );
        let size = num_pages
            .checked_mul(PAGE_SIZE)
            .ok_or(Error::with_msg(Errno::OutOfBounds, "range size overflows"))?;
        let end = vaddr
            .checked_add(size)
            .ok_or(Error::with_msg(Errno::OutOfBounds, "range wraps around"))?;
        if end > MAX_USERSPACE_VADDR {
            return_errno_with_msg!(Errno::OutOfBounds, "range leaves user space");
        }
        let range = vaddr..end;

        let mut mappings = self.mappings.lock();
        if let Some(mut i) = mappings.find(vaddr) {
            while i < mappings.len() {
                let (a, a_end) = {
                    let m = mappings.get(i);
                    (m.map_to_addr(), m.end())
                };
                if !is_intersected(&(a..a_end), &range) {
                    break;
                }
                if vaddr <= a && a_end <= end {
                    // The record is covered entirely; flag it for deletion.
                    mappings.get_mut(i).num_pages = 0;
                } else if vaddr <= a {
                    // The range covers the record's prefix.
                    let shift = (end - a) / PAGE_SIZE;
                    let m = mappings.get_mut(i);
                    m.map_to_page += shift;
                    m.frame_start += shift;
                    m.num_pages -= shift;
                } else if a_end <= end {
                    // The range covers the record's suffix.
                    mappings.get_mut(i).num_pages -= (a_end - vaddr) / PAGE_SIZE;
                } else {
                    // The range punches a hole; the tail shares the frame.
                    let mut tail = mappings.get(i).clone();
                    mappings.get_mut(i).num_pages -= (a_end - vaddr) / PAGE_SIZE;
                    let shift = (end - a) / PAGE_SIZE;
                    tail.map_to_page += shift;
                    tail.frame_start += shift;
                    tail.num_pages -= shift;
                    mappings.insert_at(i + 1, tail);
                    break;
                }
                if mappings.get(i).is_empty() {
                    mappings.remove_at(i);
                } else {
                    i += 1;
                }
            }
        }

        let root = self.root.load(Ordering::Relaxed);
        if root != 0 {
            self.remove_entries(root, &range);
        }
        mappings.check_invariants();
        Ok(())
    }

    /// Reads `buf.len()` bytes at `vaddr` by tunneling through the backing
    /// frames. The range must be fully and contiguously mapped. Works on
    /// address spaces that are not active on any CPU.
    pub fn read(&self, vaddr: Vaddr, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mappings = self.mappings.lock();
        let covered = mappings.covering(vaddr, buf.len())?;
        let mut offset = vaddr - mappings.get(covered.start).map_to_addr();
        let mut done = 0;
        for idx in covered {
            let m = mappings.get(idx);
            let limit = (m.size() - offset).min(buf.len() - done);
            m.frame
                .read(m.frame_start * PAGE_SIZE + offset, &mut buf[done..done + limit])?;
            done += limit;
            offset = 0;
        }
        Ok(())
    }

    /// Writes `buf` at `vaddr` by tunneling through the backing frames. The
    /// range must be fully and contiguously mapped. Works on address spaces
    /// that are not active on any CPU.
    pub fn write(&self, vaddr: Vaddr, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mappings = self.mappings.lock();
        let covered = mappings.covering(vaddr, buf.len())?;
        let mut offset = vaddr - mappings.get(covered.start).map_to_addr();
        let mut done = 0;
        for idx in covered {
            let m = mappings.get(idx);
            let limit = (m.size() - offset).min(buf.len() - done);
            m.frame
                .write(m.frame_start * PAGE_SIZE + offset, &buf[done..done + limit])?;
            done += limit;
            offset = 0;
        }
        Ok(())
    }

    /// Resolves a user page fault at `vaddr`.
    ///
    /// Checks the covering mapping's permissions against the fault cause,
    /// asks the backing frame for the physical page (signaling write intent
    /// so the frame can fork a copy-on-write page), installs the
    /// translation, and flushes the TLB entry on the current CPU.
    ///
    /// # Panics
    ///
    /// Panics if no root was ever started: a user fault on an address space
    /// that was never activated is a kernel bug.
    pub fn page_fault(&self, cause: FaultCause, vaddr: Vaddr) -> Result<()> {
        let vaddr = vaddr.align_down(PAGE_SIZE);
        trace!("page fault at {:#x}, cause = {:?}", vaddr, cause);

        let mappings = self.mappings.lock();
        let m = match mappings.find(vaddr) {
            Some(idx) if mappings.get(idx).range().contains(&vaddr) => mappings.get(idx),
            _ => return_errno_with_msg!(Errno::NotMapped, "page fault outside any mapping"),
        };

        match cause {
            FaultCause::Read if !m.perms.contains(VmPerms::READ) => {
                return_errno_with_msg!(Errno::ReadFault, "read of a non-readable mapping")
            }
            FaultCause::Write if !m.perms.contains(VmPerms::WRITE) => {
                return_errno_with_msg!(Errno::WriteFault, "write to a non-writable mapping")
            }
            FaultCause::Exec if !m.perms.contains(VmPerms::EXEC) => {
                return_errno_with_msg!(Errno::ExecFault, "fetch from a non-executable mapping")
            }
            _ => {}
        }

        let root = self.root.load(Ordering::Relaxed);
        assert!(
            root != 0,
            "page fault on an address space that was never started"
        );

        let page_offs = (vaddr - m.map_to_addr()) / PAGE_SIZE;
        let write_intent = matches!(cause, FaultCause::Write);
        let paddr = m.frame.page_hit(m.frame_start + page_offs, write_intent)?;
        debug_assert!(
            self.hal.query(root, vaddr) != Some(paddr),
            "page fault found the translation already present"
        );
        self.hal.map_frame(root, vaddr, paddr, m.perms, m.flags)?;
        self.hal.flush_tlb_addr(vaddr);
        Ok(())
    }

    /// Changes the access rights of `[vaddr, vaddr + num_pages * PAGE_SIZE)`,
    /// which must be fully and contiguously mapped. Records straddling the
    /// range boundaries are split, sharing their backing frame. Installed
    /// translations in the range are torn down so the next fault installs
    /// them with the new rights.
    ///
    /// # Panics
    ///
    /// Panics if `vaddr` is not page-aligned.
    pub fn protect(&self, vaddr: Vaddr, num_pages: usize, perms: VmPerms) -> Result<()> {
        trace!(
            "protect, vaddr = {:#x}, pages = {}, perms = {:?}",
            vaddr,
            num_pages,
            perms
        );
        if num_pages == 0 {
            return Ok(());
        }
        assert!(
            is_page_aligned(vaddr),
            "the protected address must be page-aligned"
        );
        let size = num_pages
            .checked_mul(PAGE_SIZE)
            .ok_or(Error::with_msg(Errno::OutOfBounds, "range size overflows"))?;
        let end = vaddr
            .checked_add(size)
            .ok_or(Error::with_msg(Errno::OutOfBounds, "range wraps around"))?;
        if end > MAX_USERSPACE_VADDR {
            return_errno_with_msg!(Errno::OutOfBounds, "range leaves user space");
        }

        let mut mappings = self.mappings.lock();
        let covered = mappings.covering(vaddr, size).map_err(|_| {
            Error::with_msg(Errno::NotMapped, "protected range is not fully mapped")
        })?;

        // Make the range boundaries coincide with record boundaries.
        let mut first = covered.start;
        let mut last = covered.end - 1;
        if mappings.get(first).map_to_addr() < vaddr {
            mappings.split_at(first, vaddr);
            first += 1;
            last += 1;
        }
        if mappings.get(last).end() > end {
            mappings.split_at(last, end);
        }
        for idx in first..=last {
            mappings.get_mut(idx).perms = perms;
        }

        let root = self.root.load(Ordering::Relaxed);
        if root != 0 {
            self.remove_entries(root, &(vaddr..end));
        }
        mappings.check_invariants();
        Ok(())
    }

    /// Removes every mapping at once, releasing the frame references and
    /// tearing down any installed translations. The page-table root is kept.
    pub fn clear(&self) {
        trace!("clear");
        let mut mappings = self.mappings.lock();
        let root = self.root.load(Ordering::Relaxed);
        if root != 0 {
            for m in mappings.iter() {
                self.remove_entries(root, &m.range());
            }
        }
        mappings.clear();
    }

    /// Tears down the installed translations of a page range. An error
    /// means laziness never installed the entry, so it is logged and
    /// swallowed.
    fn remove_entries(&self, root: Paddr, range: &Range<Vaddr>) {
        for va in (range.start..range.end).step_by(PAGE_SIZE) {
            match self.hal.unmap_frame(root, va) {
                Ok(()) => self.hal.flush_tlb_addr(va),
                Err(err) => debug!("no translation to remove at {:#x}: {:?}", va, err),
            }
        }
    }
}

impl<H: VmemHal> Drop for Vmem<H> {
    fn drop(&mut self) {
        let root = *self.root.get_mut();
        if root != 0 {
            self.hal.dealloc_root(root);
        }
    }
}

impl<H: VmemHal> Debug for Vmem<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vmem")
            .field("root", &self.root.load(Ordering::Relaxed))
            .field("mappings", &self.mappings.lock().len())
            .finish_non_exhaustive()
    }
}

/// Installs `mapping` at exactly its own base address.
///
/// A record overlapping the new range is displaced whole, even when the
/// overlap is partial; further records the range reaches go too, keeping
/// the table non-overlapping.
fn place_fixed(set: &mut MappingSet, mapping: VmMapping) -> Result<Vaddr> {
    let vaddr = mapping.map_to_addr();
    if vaddr == 0 {
        return_errno_with_msg!(Errno::InvalidAddr, "fixed placement at the null page");
    }
    let range = mapping.range();
    let Some(idx) = set.find(vaddr) else {
        set.push(mapping);
        return Ok(vaddr);
    };
    if is_intersected(&set.get(idx).range(), &range) {
        set.replace_at(idx, mapping);
        while idx + 1 < set.len() && is_intersected(&set.get(idx + 1).range(), &range) {
            set.remove_at(idx + 1);
        }
    } else if set.get(idx).map_to_addr() < vaddr {
        set.insert_at(idx + 1, mapping);
    } else {
        set.insert_at(idx, mapping);
    }
    Ok(vaddr)
}

/// Installs `mapping` into the first gap that can hold it, preferring gaps
/// at or above the hinted base address and wrapping around to lower gaps if
/// none fits.
fn place_hint(set: &mut MappingSet, mapping: VmMapping) -> Result<Vaddr> {
    let vaddr = mapping.map_to_addr();
    if set.is_empty() {
        return place_fixed(set, mapping);
    }
    let size = mapping.size();
    // `find` only yields a candidate; anchor there when it actually covers
    // the hint, otherwise scan from the bottom.
    let mid = match set.find(vaddr) {
        Some(idx) if set.get(idx).range().contains(&vaddr) => idx,
        _ => 0,
    };

    let mut chosen = None;
    for i in mid..set.len() {
        let base = set.get(i).end();
        let limit = if i + 1 < set.len() {
            set.get(i + 1).map_to_addr()
        } else {
            MAX_USERSPACE_VADDR
        };
        if limit - base > size {
            chosen = Some(base);
            break;
        }
    }
    if chosen.is_none() {
        for i in 0..mid {
            let prev_end = if i == 0 {
                LOWEST_USER_VADDR
            } else {
                set.get(i - 1).end()
            };
            let start = set.get(i).map_to_addr();
            if start - prev_end > size {
                chosen = Some(start - size);
                break;
            }
        }
    }
    let Some(base) = chosen else {
        return_errno_with_msg!(Errno::OutOfVirtMemory, "no gap large enough for the mapping");
    };

    let mut mapping = mapping;
    mapping.map_to_page = base / PAGE_SIZE;
    place_fixed(set, mapping)
}

/// Determines whether two ranges are intersected.
/// returns false if one of the ranges has a length of 0
fn is_intersected(range1: &Range<usize>, range2: &Range<usize>) -> bool {
    range1.start.max(range2.start) < range1.end.min(range2.end)
}
