// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! x86 architecture definitions needed by the instruction emulation
//! assist: control register and EFER bits, segment descriptors, RFLAGS,
//! and page table entry layouts.

#![no_std]
#![forbid(unsafe_code)]

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const X64_CR0_PE: u64 = 0x0000000000000001;
pub const X64_CR0_PG: u64 = 0x0000000080000000;

pub const X64_CR4_PSE: u64 = 0x0000000000000010;
pub const X64_CR4_PAE: u64 = 0x0000000000000020;

pub const X64_EFER_LME: u64 = 0x0000000000000100;
pub const X64_EFER_LMA: u64 = 0x0000000000000400;
pub const X64_EFER_NXE: u64 = 0x0000000000000800;

#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct SegmentAttributes {
    #[bits(4)]
    pub segment_type: u8,
    pub non_system_segment: bool,
    #[bits(2)]
    pub descriptor_privilege_level: u8,
    pub present: bool,
    #[bits(4)]
    _reserved: u8,
    pub available: bool,
    pub long: bool,
    pub default: bool,
    pub granularity: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRegister {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub attributes: SegmentAttributes,
}

#[bitfield(u64, default = false)]
#[derive(PartialEq, Eq)]
pub struct RFlags {
    pub carry: bool,
    _reserved0: bool,
    pub parity: bool,
    _reserved1: bool,
    pub adjust: bool,
    _reserved2: bool,
    pub zero: bool,
    pub sign: bool,
    pub trap: bool,
    pub interrupt_enable: bool,
    pub direction: bool,
    pub overflow: bool,
    #[bits(52)]
    _reserved3: u64,
}

impl Default for RFlags {
    fn default() -> Self {
        Self(2)
    }
}

/// A page table entry, in any of the three paging formats. A 32-bit
/// non-PAE entry is widened to 64 bits before use; its `pfn` then covers
/// address bits 31:12.
///
/// Bit 7 is the page-size bit in a directory entry and the PAT bit in a
/// 4 KiB leaf; the assist only ever reads it in the directory sense.
#[bitfield(u64)]
#[derive(PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Pte {
    pub present: bool,
    pub read_write: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global: bool,
    #[bits(3)]
    pub available0: u8,
    #[bits(40)]
    pub pfn: u64,
    #[bits(11)]
    pub available1: u64,
    pub no_execute: bool,
}

impl Pte {
    /// The physical address of the next-level table (or of a 4 KiB leaf
    /// page).
    pub fn address(&self) -> u64 {
        self.pfn() << 12
    }

    pub fn with_address(self, address: u64) -> Self {
        self.with_pfn(address >> 12)
    }
}
