// SPDX-License-Identifier: MPL-2.0

//! The hardware page-table layer that address spaces drive.

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::{
    mm::{Paddr, Vaddr, PAGE_SIZE},
    prelude::*,
    vmem::perms::{VmMapFlags, VmPerms},
};

/// The operations an address space needs from the machine's MMU.
///
/// A page table is identified by the physical address of its root page, the
/// value an address space publishes as its `cr3`. Implementations must not
/// call back into the address space that invokes them.
pub trait VmemHal: Send + Sync {
    /// Allocates and initializes a page-table root. The kernel half of the
    /// address space is already in place when this returns.
    fn alloc_root(&self) -> Result<Paddr>;

    /// Releases a root previously obtained from [`VmemHal::alloc_root`].
    fn dealloc_root(&self, root: Paddr);

    /// Loads `root` on the current CPU.
    fn switch_to(&self, root: Paddr);

    /// Installs a translation from `vaddr` to `paddr` under `root`.
    fn map_frame(
        &self,
        root: Paddr,
        vaddr: Vaddr,
        paddr: Paddr,
        perms: VmPerms,
        flags: VmMapFlags,
    ) -> Result<()>;

    /// Removes the translation at `vaddr`, failing if none is installed.
    fn unmap_frame(&self, root: Paddr, vaddr: Vaddr) -> Result<()>;

    /// Returns the physical address `vaddr` translates to, if any.
    fn query(&self, root: Paddr, vaddr: Vaddr) -> Option<Paddr>;

    /// Invalidates the TLB entry for `vaddr` on the current CPU.
    fn flush_tlb_addr(&self, vaddr: Vaddr);
}

impl<T: VmemHal> VmemHal for Arc<T> {
    fn alloc_root(&self) -> Result<Paddr> {
        (**self).alloc_root()
    }

    fn dealloc_root(&self, root: Paddr) {
        (**self).dealloc_root(root)
    }

    fn switch_to(&self, root: Paddr) {
        (**self).switch_to(root)
    }

    fn map_frame(
        &self,
        root: Paddr,
        vaddr: Vaddr,
        paddr: Paddr,
        perms: VmPerms,
        flags: VmMapFlags,
    ) -> Result<()> {
        (**self).map_frame(root, vaddr, paddr, perms, flags)
    }

    fn unmap_frame(&self, root: Paddr, vaddr: Vaddr) -> Result<()> {
        (**self).unmap_frame(root, vaddr)
    }

    fn query(&self, root: Paddr, vaddr: Vaddr) -> Option<Paddr> {
        (**self).query(root, vaddr)
    }

    fn flush_tlb_addr(&self, vaddr: Vaddr) {
        (**self).flush_tlb_addr(vaddr)
    }
}

/// A translation entry recorded by [`MemHal`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemPtEntry {
    pub paddr: Paddr,
    pub perms: VmPerms,
    pub flags: VmMapFlags,
}

/// A software page table.
///
/// Keeps one translation map per allocated root and records `switch_to` and
/// TLB activity, so tests can observe lazy materialization and eager
/// teardown without real hardware.
pub struct MemHal {
    tables: Mutex<BTreeMap<Paddr, BTreeMap<Vaddr, MemPtEntry>>>,
    next_root: AtomicUsize,
    current_root: AtomicUsize,
    tlb_flushes: AtomicUsize,
}

/// Where synthetic root pages are handed out.
const ROOT_AREA_BASE: Paddr = 0x100_0000;

impl MemHal {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(BTreeMap::new()),
            next_root: AtomicUsize::new(ROOT_AREA_BASE),
            current_root: AtomicUsize::new(0),
            tlb_flushes: AtomicUsize::new(0),
        }
    }

    /// Returns the root loaded by the last `switch_to`, or 0 if none was.
    pub fn current_root(&self) -> Paddr {
        self.current_root.load(Ordering::Relaxed)
    }

    /// Returns the recorded translation at `vaddr` under `root`, if any.
    pub fn entry(&self, root: Paddr, vaddr: Vaddr) -> Option<MemPtEntry> {
        self.tables.lock().get(&root)?.get(&vaddr).copied()
    }

    /// Returns the number of translations installed under `root`.
    pub fn entry_count(&self, root: Paddr) -> usize {
        self.tables.lock().get(&root).map_or(0, |table| table.len())
    }

    /// Returns whether `root` is a live page-table root.
    pub fn is_live_root(&self, root: Paddr) -> bool {
        self.tables.lock().contains_key(&root)
    }

    /// Returns the number of TLB invalidations issued so far.
    pub fn tlb_flush_count(&self) -> usize {
        self.tlb_flushes.load(Ordering::Relaxed)
    }
}

impl Default for MemHal {
    fn default() -> Self {
        Self::new()
    }
}

impl VmemHal for MemHal {
    fn alloc_root(&self) -> Result<Paddr> {
        let root = self.next_root.fetch_add(PAGE_SIZE, Ordering::Relaxed);
        self.tables.lock().insert(root, BTreeMap::new());
        Ok(root)
    }

    fn dealloc_root(&self, root: Paddr) {
        self.tables.lock().remove(&root);
    }

    fn switch_to(&self, root: Paddr) {
        self.current_root.store(root, Ordering::Relaxed);
    }

    fn map_frame(
        &self,
        root: Paddr,
        vaddr: Vaddr,
        paddr: Paddr,
        perms: VmPerms,
        flags: VmMapFlags,
    ) -> Result<()> {
        let mut tables = self.tables.lock();
        let Some(table) = tables.get_mut(&root) else {
            return_errno_with_msg!(Errno::InvalidArgs, "no such page-table root");
        };
        table.insert(vaddr, MemPtEntry { paddr, perms, flags });
        Ok(())
    }

    fn unmap_frame(&self, root: Paddr, vaddr: Vaddr) -> Result<()> {
        let mut tables = self.tables.lock();
        let Some(table) = tables.get_mut(&root) else {
            return_errno_with_msg!(Errno::InvalidArgs, "no such page-table root");
        };
        if table.remove(&vaddr).is_none() {
            return_errno_with_msg!(Errno::NotMapped, "no translation at the address");
        }
        Ok(())
    }

    fn query(&self, root: Paddr, vaddr: Vaddr) -> Option<Paddr> {
        self.entry(root, vaddr).map(|entry| entry.paddr)
    }

    fn flush_tlb_addr(&self, _vaddr: Vaddr) {
        self.tlb_flushes.fetch_add(1, Ordering::Relaxed);
    }
}
