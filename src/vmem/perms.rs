// SPDX-License-Identifier: MPL-2.0

use bitflags::bitflags;

bitflags! {
    /// The memory access permissions of memory mappings.
    pub struct VmPerms: u32 {
        /// Readable.
        const READ    = 1 << 0;
        /// Writable.
        const WRITE   = 1 << 1;
        /// Executable.
        const EXEC    = 1 << 2;
    }
}

bitflags! {
    /// Attributes of a mapping request.
    pub struct VmMapFlags: u32 {
        /// Install at exactly the requested address, displacing any
        /// overlapping mapping. Meaningful only at installation time.
        const FIXED = 1 << 0;
    }
}
