// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-assist register file snapshot and the sized register index
//! used by the decoder and engine.

use bitfield_struct::bitfield;
use x86defs::RFlags;
use x86defs::SegmentRegister;
use x86defs::X64_CR0_PE;
use x86defs::X64_EFER_LMA;

/// A general purpose register, in instruction encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gp {
    Rax = 0,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Gp {
    /// Maps a 4-bit register encoding (ModRM/SIB field plus REX
    /// extension bit) to the register it names.
    pub fn from_encoding(encoding: u8) -> Self {
        match encoding & 0xf {
            0 => Gp::Rax,
            1 => Gp::Rcx,
            2 => Gp::Rdx,
            3 => Gp::Rbx,
            4 => Gp::Rsp,
            5 => Gp::Rbp,
            6 => Gp::Rsi,
            7 => Gp::Rdi,
            8 => Gp::R8,
            9 => Gp::R9,
            10 => Gp::R10,
            11 => Gp::R11,
            12 => Gp::R12,
            13 => Gp::R13,
            14 => Gp::R14,
            15 => Gp::R15,
            _ => unreachable!(),
        }
    }
}

/// A segment register, in instruction encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Es = 0,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}

/// The accessed width of a general purpose register.
///
/// `Byte(shift)` carries the bit offset of the byte lane: 0 for the low
/// byte, 8 for the legacy high-byte registers AH/CH/DH/BH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpSize {
    Byte(u8),
    Word,
    Dword,
    Qword,
}

/// A general purpose register access: which 64-bit slot, and which part
/// of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterIndex {
    pub extended_index: Gp,
    pub size: GpSize,
}

impl RegisterIndex {
    pub fn new(extended_index: Gp, size: GpSize) -> Self {
        Self {
            extended_index,
            size,
        }
    }

    /// A plain access of `bytes` width (1, 2, 4 or 8), with no high-byte
    /// aliasing.
    pub fn sized(gp: Gp, bytes: u8) -> Self {
        let size = match bytes {
            1 => GpSize::Byte(0),
            2 => GpSize::Word,
            4 => GpSize::Dword,
            8 => GpSize::Qword,
            _ => unreachable!(),
        };
        Self::new(gp, size)
    }

    /// Extracts this register's value from the full 64-bit slot.
    pub fn apply_sizing(&self, value: u64) -> u64 {
        match self.size {
            GpSize::Byte(shift) => (value >> shift) & 0xff,
            GpSize::Word => value & 0xffff,
            GpSize::Dword => value & 0xffff_ffff,
            GpSize::Qword => value,
        }
    }

    /// Folds a new value into the full 64-bit slot. Byte and word writes
    /// preserve the remaining bits; dword writes zero-extend.
    pub fn apply_update(&self, current: u64, value: u64) -> u64 {
        match self.size {
            GpSize::Byte(shift) => {
                (current & !(0xff << shift)) | ((value & 0xff) << shift)
            }
            GpSize::Word => (current & !0xffff) | (value & 0xffff),
            GpSize::Dword => value & 0xffff_ffff,
            GpSize::Qword => value,
        }
    }
}

/// The execution mode the current instruction runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Bit16,
    Bit32,
    Bit64,
}

/// The register groups a [`crate::AssistVp`] get or set is scoped to.
/// `gp` covers the general purpose registers plus RIP and RFLAGS.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct RegisterSets {
    pub gp: bool,
    pub segments: bool,
    pub control: bool,
    pub msrs: bool,
    #[bits(4)]
    _reserved: u8,
}

impl RegisterSets {
    pub const ALL: Self = Self::new()
        .with_gp(true)
        .with_segments(true)
        .with_control(true)
        .with_msrs(true);

    pub const GP: Self = Self::new().with_gp(true);
}

/// The register file snapshot an assist call operates on. Fetched once
/// at entry, mutated locally, written back once on success.
#[derive(Debug, Clone, PartialEq)]
pub struct VpState {
    pub gps: [u64; 16],
    pub segs: [SegmentRegister; 6],
    pub rip: u64,
    pub rflags: RFlags,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
}

impl Default for VpState {
    fn default() -> Self {
        Self {
            gps: [0; 16],
            segs: [SegmentRegister::default(); 6],
            rip: 0,
            rflags: RFlags::default(),
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            efer: 0,
        }
    }
}

impl VpState {
    pub fn gp(&self, reg: RegisterIndex) -> u64 {
        reg.apply_sizing(self.gps[reg.extended_index as usize])
    }

    pub fn set_gp(&mut self, reg: RegisterIndex, value: u64) {
        let slot = &mut self.gps[reg.extended_index as usize];
        *slot = reg.apply_update(*slot, value);
    }

    pub fn gp64(&self, gp: Gp) -> u64 {
        self.gps[gp as usize]
    }

    pub fn set_gp64(&mut self, gp: Gp, value: u64) {
        self.gps[gp as usize] = value;
    }

    pub fn segment(&self, seg: Segment) -> SegmentRegister {
        self.segs[seg as usize]
    }

    /// Derives the execution mode from CR0, EFER and the code segment.
    pub fn mode(&self) -> ExecMode {
        if self.cr0 & X64_CR0_PE != 0 {
            if self.efer & X64_EFER_LMA != 0 {
                if self.segment(Segment::Cs).attributes.long() {
                    ExecMode::Bit64
                } else {
                    ExecMode::Bit32
                }
            } else if self.segment(Segment::Cs).attributes.default() {
                ExecMode::Bit32
            } else {
                ExecMode::Bit16
            }
        } else {
            ExecMode::Bit16
        }
    }
}
