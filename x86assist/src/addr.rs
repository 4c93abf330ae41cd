// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Address newtypes. Guest-virtual, guest-physical, and host-virtual
//! addresses never mix; the only conversion points are the page table
//! walker (gva to gpa) and the caller's mapping table (gpa to hva).

use core::fmt;

pub const PAGE_SIZE: u64 = 0x1000;
pub const PAGE_SHIFT: u32 = 12;

/// A guest virtual address.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gva(u64);

impl Gva {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn addr(self) -> u64 {
        self.0
    }

    pub fn wrapping_add(self, offset: u64) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    pub const fn offset_in_page(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl fmt::Debug for Gva {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Gva")
            .field(&format_args!("{:#x}", self.0))
            .finish()
    }
}

/// A guest physical address.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gpa(u64);

impl Gpa {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn addr(self) -> u64 {
        self.0
    }

    pub fn wrapping_add(self, offset: u64) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    pub const fn offset_in_page(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl fmt::Debug for Gpa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Gpa")
            .field(&format_args!("{:#x}", self.0))
            .finish()
    }
}

/// A host virtual address, as produced by the caller's gpa-to-hva
/// mapping table. The assist never dereferences one.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hva(u64);

impl Hva {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn addr(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Hva {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hva")
            .field(&format_args!("{:#x}", self.0))
            .finish()
    }
}
