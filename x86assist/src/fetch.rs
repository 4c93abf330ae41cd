// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Instruction fetch. When hardware did not capture the instruction
//! bytes, they are read from CS:RIP through the page tables, allowing
//! the window to straddle one page boundary.

use crate::addr::PAGE_SIZE;
use crate::cpu::GuestMemory;
use crate::cpu::Prot;
use crate::exit::MemoryExit;
use crate::operand::apply_segment;
use crate::operand::segment_limit;
use crate::registers::ExecMode;
use crate::registers::Segment;
use crate::registers::VpState;
use crate::translate::translate_checked;
use crate::Error;

/// The architectural instruction length limit.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// A fetched (or hardware-captured) instruction window.
#[derive(Debug, Clone)]
pub struct InstructionBytes {
    pub bytes: [u8; MAX_INSTRUCTION_LEN],
    pub valid: usize,
}

impl InstructionBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.valid]
    }
}

pub(crate) fn fetch_instruction<E>(
    state: &VpState,
    guest_memory: &impl GuestMemory,
    exit: &MemoryExit,
) -> Result<InstructionBytes, Error<E>> {
    let mut bytes = [0; MAX_INSTRUCTION_LEN];

    if let Some(captured) = exit.captured_bytes() {
        bytes[..captured.len()].copy_from_slice(captured);
        return Ok(InstructionBytes {
            bytes,
            valid: captured.len(),
        });
    }

    // Outside long mode the window is clamped to the code segment
    // limit.
    let mut len = MAX_INSTRUCTION_LEN;
    if state.mode() != ExecMode::Bit64 {
        let limit = segment_limit(&state.segment(Segment::Cs));
        if state.rip > limit {
            return Err(Error::SegmentLimit {
                segment: Segment::Cs,
                offset: state.rip,
                len: 1,
            });
        }
        len = len.min((limit - state.rip + 1) as usize);
    }

    let gva = apply_segment(state, Segment::Cs, state.rip, len)?;
    tracing::trace!(?gva, len, "fetching instruction");

    // At most one page boundary can fall inside the window, so at most
    // two translations are needed.
    let first_len = len.min((PAGE_SIZE - gva.offset_in_page()) as usize);
    let gpa = translate_checked(state, guest_memory, gva, Prot::EXECUTE)?;
    guest_memory
        .read(gpa, &mut bytes[..first_len])
        .map_err(Error::Memory)?;

    if first_len < len {
        let next = gva.wrapping_add(first_len as u64);
        let gpa = translate_checked(state, guest_memory, next, Prot::EXECUTE)?;
        guest_memory
            .read(gpa, &mut bytes[first_len..len])
            .map_err(Error::Memory)?;
    }

    Ok(InstructionBytes { bytes, valid: len })
}
