// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The port I/O assist entry point. Hardware pre-decodes IN/OUT/INS/
//! OUTS, so no instruction fetch or decode happens here; the exit
//! record carries everything needed.

use crate::addr::Gpa;
use crate::addr::Gva;
use crate::addr::PAGE_SIZE;
use crate::cpu::AssistVp;
use crate::cpu::DeviceIo;
use crate::cpu::GuestMemory;
use crate::cpu::Prot;
use crate::exit::IoDirection;
use crate::exit::IoExit;
use crate::operand::apply_segment;
use crate::registers::Gp;
use crate::registers::RegisterIndex;
use crate::registers::RegisterSets;
use crate::registers::Segment;
use crate::registers::VpState;
use crate::translate::translate_checked;
use crate::Error;

/// Emulates the I/O instruction behind a port exit.
///
/// On success the updated registers are written back through `vp`; on
/// any error the virtual processor is left untouched.
pub fn assist_io<V: AssistVp>(
    vp: &mut V,
    guest_memory: &impl GuestMemory,
    dev: &mut impl DeviceIo,
    exit: &IoExit,
) -> Result<(), Error<V::Error>> {
    let mut state = vp.get_state(RegisterSets::ALL).map_err(Error::Vp)?;
    tracing::trace!(port = exit.port, ?exit.direction, string = exit.string, "io assist");
    if exit.string {
        assist_io_string(&mut state, guest_memory, dev, exit)?;
    } else {
        let size = exit.operand_size as usize;
        match exit.direction {
            IoDirection::Out => {
                let data = state.gp64(Gp::Rax).to_le_bytes();
                dev.write_io(exit.port, &data[..size]);
            }
            IoDirection::In => {
                let mut data = [0; 4];
                dev.read_io(exit.port, &mut data[..size]);
                // A narrow IN leaves the rest of EAX alone; a 4-byte
                // read zero-extends into the upper half of RAX.
                state.set_gp(
                    RegisterIndex::sized(Gp::Rax, exit.operand_size),
                    u32::from_le_bytes(data) as u64,
                );
            }
        }
        state.rip = exit.next_rip;
    }
    vp.set_state(&state, RegisterSets::GP).map_err(Error::Vp)?;
    Ok(())
}

fn assist_io_string<E>(
    state: &mut VpState,
    guest_memory: &impl GuestMemory,
    dev: &mut impl DeviceIo,
    exit: &IoExit,
) -> Result<(), Error<E>> {
    let count = RegisterIndex::sized(Gp::Rcx, exit.address_size);
    if exit.rep && state.gp(count) == 0 {
        state.rip = exit.next_rip;
        return Ok(());
    }

    // A string IN stores through ES:rDI, override or not; OUT reads
    // from the exit-reported segment (DS unless overridden) at rSI.
    let (segment, index_gp, required) = match exit.direction {
        IoDirection::In => (Segment::Es, Gp::Rdi, Prot::WRITE),
        IoDirection::Out => (exit.segment, Gp::Rsi, Prot::READ),
    };
    let index = RegisterIndex::sized(index_gp, exit.address_size);
    let size = exit.operand_size as usize;

    let gva = apply_segment(state, segment, state.gp(index), size)?;
    let buffer = resolve_buffer(state, guest_memory, gva, size, required)?;

    let mut data = [0; 4];
    match exit.direction {
        IoDirection::Out => {
            buffer.read(guest_memory, &mut data[..size])?;
            dev.write_io(exit.port, &data[..size]);
        }
        IoDirection::In => {
            dev.read_io(exit.port, &mut data[..size]);
            buffer.write(guest_memory, &data[..size])?;
        }
    }

    let delta = if state.rflags.direction() {
        (size as u64).wrapping_neg()
    } else {
        size as u64
    };
    state.set_gp(index, state.gp(index).wrapping_add(delta));

    if exit.rep {
        let remaining = state.gp(count).wrapping_sub(1);
        state.set_gp(count, remaining);
        if remaining == 0 {
            state.rip = exit.next_rip;
        }
    } else {
        state.rip = exit.next_rip;
    }
    Ok(())
}

/// A guest RAM buffer for one string element, split across at most one
/// page boundary.
struct IoBuffer {
    first: (Gpa, usize),
    second: Option<(Gpa, usize)>,
}

impl IoBuffer {
    fn read<E>(&self, guest_memory: &impl GuestMemory, data: &mut [u8]) -> Result<(), Error<E>> {
        let (gpa, len) = self.first;
        guest_memory.read(gpa, &mut data[..len]).map_err(Error::Memory)?;
        if let Some((gpa, _)) = self.second {
            guest_memory.read(gpa, &mut data[len..]).map_err(Error::Memory)?;
        }
        Ok(())
    }

    fn write<E>(&self, guest_memory: &impl GuestMemory, data: &[u8]) -> Result<(), Error<E>> {
        let (gpa, len) = self.first;
        guest_memory.write(gpa, &data[..len]).map_err(Error::Memory)?;
        if let Some((gpa, _)) = self.second {
            guest_memory.write(gpa, &data[len..]).map_err(Error::Memory)?;
        }
        Ok(())
    }
}

/// Translates the buffer, page by page, checking both the walk
/// permissions and the mapping table.
fn resolve_buffer<E>(
    state: &VpState,
    guest_memory: &impl GuestMemory,
    gva: Gva,
    len: usize,
    required: Prot,
) -> Result<IoBuffer, Error<E>> {
    let first_len = len.min((PAGE_SIZE - gva.offset_in_page()) as usize);
    let first = checked_span(state, guest_memory, gva, required)?;
    let second = if first_len < len {
        let next = gva.wrapping_add(first_len as u64);
        Some((checked_span(state, guest_memory, next, required)?, len - first_len))
    } else {
        None
    };
    Ok(IoBuffer {
        first: (first, first_len),
        second,
    })
}

fn checked_span<E>(
    state: &VpState,
    guest_memory: &impl GuestMemory,
    gva: Gva,
    required: Prot,
) -> Result<Gpa, Error<E>> {
    let gpa = translate_checked(state, guest_memory, gva, required)?;
    let mapping = guest_memory.lookup(gpa).map_err(Error::Memory)?;
    if !mapping.prot.contains(required) {
        return Err(Error::NoPermission {
            gva,
            required,
            actual: mapping.prot,
        });
    }
    Ok(gpa)
}
