// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Instruction emulation assist for hardware-virtualized x86 guests.
//!
//! When a guest instruction touches device memory or an I/O port, the
//! processor exits instead of completing it. This library finishes the
//! instruction in software: [`assist_mem`] fetches, decodes and
//! emulates the memory-touching instruction behind an MMIO exit, and
//! [`assist_io`] completes the pre-decoded IN/OUT/INS/OUTS behind a
//! port exit. Register access, guest RAM, and the device model are
//! borrowed from the caller through the [`AssistVp`], [`GuestMemory`]
//! and [`DeviceIo`] traits; each assist call is otherwise self
//! contained and holds no state across calls.
//!
//! Only the instruction forms that can plausibly fault on device
//! memory are decoded: the mov, or, and, xor, stos and lods families.
//! Anything else surfaces as [`Error::UnsupportedInstruction`] for the
//! caller to handle.

#![forbid(unsafe_code)]

pub mod addr;
pub mod cpu;
pub mod decode;
pub mod emulate;
pub mod exit;
pub mod fetch;
pub mod io;
pub mod operand;
pub mod registers;
pub mod translate;

pub use addr::Gpa;
pub use addr::Gva;
pub use addr::Hva;
pub use cpu::AssistVp;
pub use cpu::DeviceIo;
pub use cpu::GuestMemory;
pub use cpu::Mapping;
pub use cpu::NotMapped;
pub use cpu::Prot;
pub use emulate::assist_mem;
pub use exit::IoDirection;
pub use exit::IoExit;
pub use exit::MemoryExit;
pub use fetch::MAX_INSTRUCTION_LEN;
pub use io::assist_io;
pub use registers::RegisterSets;
pub use registers::Segment;
pub use registers::VpState;

/// An assist call failure. No virtual processor state has been written
/// back when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum Error<E> {
    /// The instruction is outside the emulated subset. The payload is
    /// the bytes examined before giving up.
    #[error("unsupported instruction {0:02x?}")]
    UnsupportedInstruction(Vec<u8>),
    /// The instruction window ended before the instruction did.
    #[error("not enough instruction bytes")]
    NotEnoughBytes,
    /// The page table walk rejected the access; reflect as a page
    /// fault.
    #[error("page table walk failed for {gva:?}")]
    PageWalk {
        gva: Gva,
        #[source]
        source: translate::Error,
    },
    /// The walk succeeded but the accumulated permissions do not allow
    /// the access.
    #[error("{required:?} access to {gva:?} denied, walk yielded {actual:?}")]
    NoPermission {
        gva: Gva,
        required: Prot,
        actual: Prot,
    },
    /// The effective address lies outside the segment limit; reflect as
    /// a general protection fault.
    #[error("offset {offset:#x} (+{len}) outside the {segment:?} limit")]
    SegmentLimit {
        segment: Segment,
        offset: u64,
        len: usize,
    },
    /// A non-string memory operand straddles a page boundary, which
    /// this assist does not emulate.
    #[error("{len}-byte operand at {gva:?} crosses a page boundary")]
    CrossPageOperand { gva: Gva, len: usize },
    /// Guest RAM the assist itself needed (page tables, instruction
    /// bytes, string buffers) was not mapped.
    #[error("guest memory inaccessible")]
    Memory(#[source] NotMapped),
    /// The register get/set callback failed.
    #[error("virtual processor state access failed")]
    Vp(#[source] E),
}

impl<E> Error<E> {
    /// Whether this error describes something the guest did, suitable
    /// for reflecting back into it as a fault, rather than a limitation
    /// or failure of the host.
    pub fn is_guest_fault(&self) -> bool {
        matches!(
            self,
            Error::PageWalk { .. } | Error::NoPermission { .. } | Error::SegmentLimit { .. }
        )
    }
}

impl<E> From<decode::Error> for Error<E> {
    fn from(err: decode::Error) -> Self {
        match err {
            decode::Error::UnsupportedInstruction(bytes) => Error::UnsupportedInstruction(bytes),
            decode::Error::NotEnoughBytes => Error::NotEnoughBytes,
        }
    }
}
