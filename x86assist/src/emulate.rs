// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The emulation engine and the MMIO assist entry point.

use crate::cpu::AssistVp;
use crate::cpu::DeviceIo;
use crate::cpu::GuestMemory;
use crate::decode::DecodedInstr;
use crate::decode::Decoder;
use crate::decode::EmulOp;
use crate::decode::Operand;
use crate::exit::MemoryExit;
use crate::fetch::fetch_instruction;
use crate::operand::resolve;
use crate::operand::Access;
use crate::operand::OperationKind;
use crate::registers::Gp;
use crate::registers::RegisterIndex;
use crate::registers::RegisterSets;
use crate::registers::VpState;
use crate::Error;
use x86defs::RFlags;

/// Emulates the instruction behind an MMIO exit.
///
/// On success the updated registers are written back through `vp`; on
/// any error the virtual processor is left untouched so the caller can
/// reflect a fault or reset the guest.
pub fn assist_mem<V: AssistVp>(
    vp: &mut V,
    guest_memory: &impl GuestMemory,
    dev: &mut impl DeviceIo,
    exit: &MemoryExit,
) -> Result<(), Error<V::Error>> {
    let mut state = vp.get_state(RegisterSets::ALL).map_err(Error::Vp)?;
    let bytes = fetch_instruction(&state, guest_memory, exit)?;
    let instr = Decoder::new(state.mode(), bytes.as_slice()).run()?;
    tracing::trace!(?instr, gpa = ?exit.gpa, "emulating mmio instruction");
    emulate(&mut state, guest_memory, dev, &instr)?;
    vp.set_state(&state, RegisterSets::GP).map_err(Error::Vp)?;
    Ok(())
}

fn emulate<E>(
    state: &mut VpState,
    guest_memory: &impl GuestMemory,
    dev: &mut impl DeviceIo,
    instr: &DecodedInstr,
) -> Result<(), Error<E>> {
    if instr.rep_string() {
        let count = state.gp(count_register(instr));
        if count == 0 {
            state.rip = state.rip.wrapping_add(instr.len as u64);
            return Ok(());
        }
    }

    match instr.op {
        EmulOp::Mov => {
            let value = read_operand(state, guest_memory, dev, instr, &instr.source)?;
            let dest = resolve(state, guest_memory, instr, &instr.dest, OperationKind::Write)?;
            write_access(state, dev, dest, value);
        }
        EmulOp::Or | EmulOp::And | EmulOp::Xor => {
            let src = read_operand(state, guest_memory, dev, instr, &instr.source)?;
            let dest = resolve(
                state,
                guest_memory,
                instr,
                &instr.dest,
                OperationKind::ReadWrite,
            )?;
            let current = read_access(state, dev, dest);
            let result = match instr.op {
                EmulOp::Or => current | src,
                EmulOp::And => current & src,
                EmulOp::Xor => current ^ src,
                _ => unreachable!(),
            };
            update_logic_flags(&mut state.rflags, instr.operand_size, result);
            write_access(state, dev, dest, result);
        }
        EmulOp::Stos => {
            let value = state.gp(RegisterIndex::sized(Gp::Rax, instr.operand_size));
            let dest = resolve(state, guest_memory, instr, &instr.dest, OperationKind::Write)?;
            write_access(state, dev, dest, value);
            step_index(state, instr, Gp::Rdi);
        }
        EmulOp::Lods => {
            let source = resolve(state, guest_memory, instr, &instr.source, OperationKind::Read)?;
            let value = read_access(state, dev, source);
            state.set_gp(RegisterIndex::sized(Gp::Rax, instr.operand_size), value);
            step_index(state, instr, Gp::Rsi);
        }
    }

    finish_instruction(state, instr);
    Ok(())
}

fn read_operand<E>(
    state: &VpState,
    guest_memory: &impl GuestMemory,
    dev: &mut impl DeviceIo,
    instr: &DecodedInstr,
    operand: &Operand,
) -> Result<u64, Error<E>> {
    let access = resolve(state, guest_memory, instr, operand, OperationKind::Read)?;
    Ok(read_access(state, dev, access))
}

fn read_access(state: &VpState, dev: &mut impl DeviceIo, access: Access) -> u64 {
    match access {
        Access::Reg(reg) => state.gp(reg),
        Access::Imm(value) => value,
        Access::Mem(mem) => {
            let mut data = [0; 8];
            dev.read_mmio(mem.gpa, &mut data[..mem.len as usize]);
            u64::from_le_bytes(data)
        }
    }
}

fn write_access(state: &mut VpState, dev: &mut impl DeviceIo, access: Access, value: u64) {
    match access {
        Access::Reg(reg) => state.set_gp(reg, value),
        Access::Mem(mem) => {
            dev.write_mmio(mem.gpa, &value.to_le_bytes()[..mem.len as usize]);
        }
        Access::Imm(_) => unreachable!("immediates are never destinations"),
    }
}

/// Recomputes sign, zero and parity and clears carry and overflow, as
/// the logic instructions do. The adjust flag is left alone
/// (architecturally undefined).
fn update_logic_flags(rflags: &mut RFlags, size: u8, result: u64) {
    let width = size as u32 * 8;
    let masked = if width == 64 {
        result
    } else {
        result & ((1 << width) - 1)
    };
    rflags.set_carry(false);
    rflags.set_overflow(false);
    rflags.set_zero(masked == 0);
    rflags.set_sign(masked & (1 << (width - 1)) != 0);
    // Parity of the low byte only.
    rflags.set_parity((0x9669 >> ((masked ^ (masked >> 4)) & 0xf)) & 1 != 0);
}

/// Steps RDI/RSI by the operand size, down instead of up when the
/// direction flag is set, at the instruction's address width.
fn step_index(state: &mut VpState, instr: &DecodedInstr, gp: Gp) {
    let size = instr.operand_size as u64;
    let delta = if state.rflags.direction() {
        size.wrapping_neg()
    } else {
        size
    };
    let index = RegisterIndex::sized(gp, instr.address_size);
    let value = state.gp(index).wrapping_add(delta);
    state.set_gp(index, value);
}

fn count_register(instr: &DecodedInstr) -> RegisterIndex {
    RegisterIndex::sized(Gp::Rcx, instr.address_size)
}

/// One emulated iteration is done: advance RIP, except mid-repeat where
/// only the count moves and the instruction restarts on reentry.
fn finish_instruction(state: &mut VpState, instr: &DecodedInstr) {
    if instr.rep_string() {
        let count = count_register(instr);
        let remaining = state.gp(count).wrapping_sub(1);
        state.set_gp(count, remaining);
        if remaining == 0 {
            state.rip = state.rip.wrapping_add(instr.len as u64);
        }
    } else {
        state.rip = state.rip.wrapping_add(instr.len as u64);
    }
}
