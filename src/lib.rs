// SPDX-License-Identifier: MPL-2.0

//! Virtual memory address-space objects.
//!
//! A [`Vmem`] keeps an ordered, non-overlapping catalog of virtual-memory
//! mappings, each backed by a window of a shareable [`VmFrame`], and drives a
//! hardware page table through the [`VmemHal`] seam. Hardware translations
//! are materialized lazily on page fault and torn down eagerly on unmap.
//!
//! The two collaborator seams ship with in-memory implementations,
//! [`MemFrame`] and [`MemHal`], so the address-space logic can run and be
//! tested without real hardware behind it.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

mod error;
mod frame;
mod hal;
mod mm;
mod prelude;
mod vmem;

pub use self::{
    error::{Errno, Error},
    frame::{MemFrame, VmFrame},
    hal::{MemHal, MemPtEntry, VmemHal},
    mm::{
        is_page_aligned, is_userspace_vaddr, Paddr, Vaddr, LOWEST_USER_VADDR,
        MAX_USERSPACE_VADDR, PAGE_SIZE,
    },
    vmem::{
        perms::{VmMapFlags, VmPerms},
        FaultCause, Vmem,
    },
};
