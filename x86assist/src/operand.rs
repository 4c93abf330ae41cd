// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Turns a decoded operand into something the engine can act on: a
//! sized register slot, an immediate, or a translated single-page
//! memory access.

use crate::addr::Gva;
use crate::addr::PAGE_SIZE;
use crate::cpu::GuestMemory;
use crate::cpu::Prot;
use crate::decode::Base;
use crate::decode::DecodedInstr;
use crate::decode::MemOperand;
use crate::decode::Operand;
use crate::registers::ExecMode;
use crate::registers::RegisterIndex;
use crate::registers::Segment;
use crate::registers::VpState;
use crate::translate::translate_checked;
use crate::Error;
use x86defs::SegmentRegister;

use crate::addr::Gpa;

/// What the engine intends to do with the resolved location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
    ReadWrite,
}

impl OperationKind {
    fn required_prot(self) -> Prot {
        match self {
            OperationKind::Read => Prot::READ,
            OperationKind::Write => Prot::WRITE,
            OperationKind::ReadWrite => Prot::READ_WRITE,
        }
    }
}

/// A translated memory access. Always confined to one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAccess {
    pub gva: Gva,
    pub gpa: Gpa,
    pub len: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Reg(RegisterIndex),
    Imm(u64),
    Mem(MemAccess),
}

pub fn resolve<E>(
    state: &VpState,
    guest_memory: &impl GuestMemory,
    instr: &DecodedInstr,
    operand: &Operand,
    op: OperationKind,
) -> Result<Access, Error<E>> {
    match operand {
        Operand::Reg(reg) => Ok(Access::Reg(*reg)),
        Operand::Imm(value) => Ok(Access::Imm(*value)),
        Operand::Mem(mem) => {
            let offset = effective_address(state, instr, mem);
            mem_access(state, guest_memory, mem.segment, offset, instr.operand_size, op)
        }
        Operand::MemOffset { segment, offset } => {
            mem_access(state, guest_memory, *segment, *offset, instr.operand_size, op)
        }
    }
}

/// base + index*scale + disp, truncated to the address size.
fn effective_address(state: &VpState, instr: &DecodedInstr, mem: &MemOperand) -> u64 {
    let mut ea = mem.disp as u64;
    match mem.base {
        Base::None => {}
        Base::Gp(gp) => {
            ea = ea.wrapping_add(state.gp(RegisterIndex::sized(gp, instr.address_size)));
        }
        Base::Rip => {
            ea = ea.wrapping_add(state.rip.wrapping_add(instr.len as u64));
        }
    }
    if let Some(index) = mem.index {
        let value = state.gp(RegisterIndex::sized(index, instr.address_size));
        ea = ea.wrapping_add(value.wrapping_mul(mem.scale as u64));
    }
    match instr.address_size {
        2 => ea & 0xffff,
        4 => ea & 0xffff_ffff,
        _ => ea,
    }
}

fn mem_access<E>(
    state: &VpState,
    guest_memory: &impl GuestMemory,
    segment: Segment,
    offset: u64,
    len: u8,
    op: OperationKind,
) -> Result<Access, Error<E>> {
    let gva = apply_segment(state, segment, offset, len as usize)?;
    if gva.offset_in_page() + len as u64 > PAGE_SIZE {
        return Err(Error::CrossPageOperand {
            gva,
            len: len as usize,
        });
    }
    let gpa = translate_checked(state, guest_memory, gva, op.required_prot())?;
    Ok(Access::Mem(MemAccess { gva, gpa, len }))
}

/// Applies segmentation to a segment-relative offset. In long mode only
/// FS and GS carry a base and limits are not checked; elsewhere the
/// access must lie within the segment limit and the linear address
/// wraps at 4 GiB.
pub(crate) fn apply_segment<E>(
    state: &VpState,
    segment: Segment,
    offset: u64,
    len: usize,
) -> Result<Gva, Error<E>> {
    let reg = state.segment(segment);
    match state.mode() {
        ExecMode::Bit64 => {
            let base = match segment {
                Segment::Fs | Segment::Gs => reg.base,
                _ => 0,
            };
            Ok(Gva::new(base.wrapping_add(offset)))
        }
        ExecMode::Bit32 | ExecMode::Bit16 => {
            let limit = segment_limit(&reg);
            let end = offset.wrapping_add(len as u64 - 1);
            if end < offset || end > limit {
                return Err(Error::SegmentLimit {
                    segment,
                    offset,
                    len,
                });
            }
            Ok(Gva::new((reg.base.wrapping_add(offset)) as u32 as u64))
        }
    }
}

/// The segment limit in bytes, scaled by the granularity bit.
pub(crate) fn segment_limit(reg: &SegmentRegister) -> u64 {
    if reg.attributes.granularity() {
        ((reg.limit as u64) << 12) | 0xfff
    } else {
        reg.limit as u64
    }
}
