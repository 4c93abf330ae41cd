// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The external collaborators an assist call borrows: the virtual
//! processor's register file, the guest memory mapping, and the device
//! model.

use crate::addr::Gpa;
use crate::addr::Hva;
use crate::registers::RegisterSets;
use crate::registers::VpState;
use bitfield_struct::bitfield;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Page or mapping protections. Accumulated by intersection during a
/// page table walk; never widened.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct Prot {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub user: bool,
    #[bits(4)]
    _reserved: u8,
}

impl Prot {
    pub const NONE: Self = Self::new();
    pub const READ: Self = Self::new().with_read(true);
    pub const WRITE: Self = Self::new().with_write(true);
    pub const EXECUTE: Self = Self::new().with_execute(true);
    pub const READ_WRITE: Self = Self::new().with_read(true).with_write(true);
    pub const ALL: Self = Self::new()
        .with_read(true)
        .with_write(true)
        .with_execute(true)
        .with_user(true);

    pub fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn contains(self, required: Self) -> bool {
        self.0 & required.0 == required.0
    }
}

/// Access to the virtual processor's registers across the trap
/// boundary. The selector mask scopes each crossing to the register
/// groups actually needed.
pub trait AssistVp {
    type Error: 'static + std::error::Error + Send + Sync;

    fn get_state(&mut self, sets: RegisterSets) -> Result<VpState, Self::Error>;

    fn set_state(&mut self, state: &VpState, sets: RegisterSets) -> Result<(), Self::Error>;
}

/// A gpa that the mapping table does not cover.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("guest physical address {0:?} is not mapped")]
pub struct NotMapped(pub Gpa);

/// One entry of the caller's gpa-to-hva mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub hva: Hva,
    pub prot: Prot,
}

/// Read-only access to guest RAM: the shared mapping table plus byte
/// access through it. Page table entries and string I/O buffers are
/// read this way; emulated device accesses never are.
pub trait GuestMemory {
    /// Probes the mapping table for the page containing `gpa`.
    fn lookup(&self, gpa: Gpa) -> Result<Mapping, NotMapped>;

    fn read(&self, gpa: Gpa, data: &mut [u8]) -> Result<(), NotMapped>;

    fn write(&self, gpa: Gpa, data: &[u8]) -> Result<(), NotMapped>;

    /// Reads a plain value out of guest RAM.
    fn read_plain<T: FromBytes + IntoBytes>(&self, gpa: Gpa) -> Result<T, NotMapped>
    where
        Self: Sized,
    {
        let mut value = T::new_zeroed();
        self.read(gpa, value.as_mut_bytes())?;
        Ok(value)
    }
}

/// The device model callback. Every emulated memory or port access goes
/// through here; by contract the device handles any width the decoder
/// can produce and never fails.
pub trait DeviceIo {
    fn read_mmio(&mut self, gpa: Gpa, data: &mut [u8]);

    fn write_mmio(&mut self, gpa: Gpa, data: &[u8]);

    fn read_io(&mut self, port: u16, data: &mut [u8]);

    fn write_io(&mut self, port: u16, data: &[u8]);
}
