// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Port I/O assist tests: register forms, string forms, rep handling.

use super::common::*;
use x86assist::assist_io;
use x86assist::registers::Segment;
use x86assist::registers::VpState;
use x86assist::IoDirection;
use x86assist::IoExit;

const RAX: usize = 0;
const RCX: usize = 1;
const RSI: usize = 6;
const RDI: usize = 7;

const BUF_VA: u64 = 0x3000;
const BUF_PA: u64 = 0x7000;
const NEXT_RIP: u64 = 0x1002;

fn io_exit(direction: IoDirection, operand_size: u8) -> IoExit {
    IoExit {
        direction,
        port: 0x60,
        operand_size,
        address_size: 8,
        segment: Segment::Ds,
        rep: false,
        string: false,
        next_rip: NEXT_RIP,
    }
}

fn string_setup() -> (TestMemory, TestVp) {
    let mem = TestMemory::new(0x40000);
    let mut pool = TablePool::new(0x10000);
    let cr3 = pool.alloc();
    map_long(&mem, &mut pool, cr3, BUF_VA, BUF_PA, full_pte());
    let mut state = long_mode_state(cr3);
    state.rip = 0x1000;
    (mem, TestVp::new(state))
}

#[test]
fn out_writes_rax_bytes() {
    let mem = TestMemory::new(0x1000);
    let mut vp = TestVp::new(VpState::default());
    let mut dev = TestDevice::default();
    vp.state.gps[RAX] = 0x1122_3344_5566_77ab;

    assist_io(&mut vp, &mem, &mut dev, &io_exit(IoDirection::Out, 1)).unwrap();

    assert_eq!(dev.io_writes, vec![(0x60, vec![0xab])]);
    assert_eq!(vp.state.rip, NEXT_RIP);
    assert_eq!(vp.set_calls, 1);
}

#[test]
fn narrow_in_preserves_rest_of_rax() {
    let mem = TestMemory::new(0x1000);
    let mut vp = TestVp::new(VpState::default());
    let mut dev = TestDevice::default();
    vp.state.gps[RAX] = 0x1111_2222_3333_4455;
    dev.io_read_value = 0x5a;

    assist_io(&mut vp, &mem, &mut dev, &io_exit(IoDirection::In, 1)).unwrap();

    assert_eq!(dev.io_reads, vec![(0x60, 1)]);
    assert_eq!(vp.state.gps[RAX], 0x1111_2222_3333_445a);
    assert_eq!(vp.state.rip, NEXT_RIP);
}

#[test]
fn dword_in_zero_extends_rax() {
    let mem = TestMemory::new(0x1000);
    let mut vp = TestVp::new(VpState::default());
    let mut dev = TestDevice::default();
    vp.state.gps[RAX] = !0;
    dev.io_read_value = 0x8899_aabb;

    assist_io(&mut vp, &mem, &mut dev, &io_exit(IoDirection::In, 4)).unwrap();

    assert_eq!(vp.state.gps[RAX], 0x8899_aabb);
}

#[test]
fn string_out_reads_guest_memory() {
    let (mem, mut vp) = string_setup();
    let mut dev = TestDevice::default();
    mem.write_bytes(BUF_PA, &[0xab, 0xcd]);
    vp.state.gps[RSI] = BUF_VA;

    let exit = IoExit {
        string: true,
        ..io_exit(IoDirection::Out, 2)
    };
    assist_io(&mut vp, &mem, &mut dev, &exit).unwrap();

    assert_eq!(dev.io_writes, vec![(0x60, vec![0xab, 0xcd])]);
    assert_eq!(vp.state.gps[RSI], BUF_VA + 2);
    assert_eq!(vp.state.rip, NEXT_RIP);
}

#[test]
fn rep_ins_word_one_iteration() {
    // rep insw with a count of three: one element moves, the index
    // steps, the count drops, and the PC stays on the instruction.
    let (mem, mut vp) = string_setup();
    let mut dev = TestDevice::default();
    vp.state.gps[RDI] = BUF_VA;
    vp.state.gps[RCX] = 3;
    dev.io_read_value = 0xbeef;

    let exit = IoExit {
        string: true,
        rep: true,
        ..io_exit(IoDirection::In, 2)
    };
    assist_io(&mut vp, &mem, &mut dev, &exit).unwrap();

    assert_eq!(mem.read_bytes(BUF_PA, 2), vec![0xef, 0xbe]);
    assert_eq!(vp.state.gps[RDI], BUF_VA + 2);
    assert_eq!(vp.state.gps[RCX], 2);
    assert_eq!(vp.state.rip, 0x1000);

    // The last iteration moves the PC past the instruction.
    vp.state.gps[RCX] = 1;
    assist_io(&mut vp, &mem, &mut dev, &exit).unwrap();
    assert_eq!(vp.state.gps[RCX], 0);
    assert_eq!(vp.state.rip, NEXT_RIP);
}

#[test]
fn rep_with_zero_count_is_a_noop() {
    let (mem, mut vp) = string_setup();
    let mut dev = TestDevice::default();
    vp.state.gps[RDI] = BUF_VA;
    vp.state.gps[RCX] = 0;

    let exit = IoExit {
        string: true,
        rep: true,
        ..io_exit(IoDirection::In, 2)
    };
    assist_io(&mut vp, &mem, &mut dev, &exit).unwrap();

    assert!(dev.io_reads.is_empty());
    assert_eq!(vp.state.rip, NEXT_RIP);
}

#[test]
fn string_buffer_may_straddle_one_page() {
    let (mem, mut vp) = string_setup();
    let mut dev = TestDevice::default();
    let mut pool = TablePool::new(0x20000);
    // The next virtual page maps to a discontiguous physical page.
    map_long(&mem, &mut pool, vp.state.cr3, BUF_VA + 0x1000, 0x9000, full_pte());
    vp.state.gps[RDI] = BUF_VA + 0xfff;
    dev.io_read_value = 0xbeef;

    let exit = IoExit {
        string: true,
        ..io_exit(IoDirection::In, 2)
    };
    assist_io(&mut vp, &mem, &mut dev, &exit).unwrap();

    assert_eq!(mem.read_bytes(BUF_PA + 0xfff, 1), vec![0xef]);
    assert_eq!(mem.read_bytes(0x9000, 1), vec![0xbe]);
    assert_eq!(vp.state.gps[RDI], BUF_VA + 0xfff + 2);
}

#[test]
fn string_in_stores_through_es() {
    // In 32-bit mode a nonzero ES base shifts the store; the exit's
    // segment field is ignored for IN.
    let mem = TestMemory::new(0x40000);
    let mut pool = TablePool::new(0x10000);
    let cr3 = pool.alloc();
    map_32(&mem, &mut pool, cr3, BUF_VA, BUF_PA, full_pte());
    let mut state = legacy32_state(cr3, false);
    state.segs[0].base = 0x100;
    state.gps[RDI] = BUF_VA;
    let mut vp = TestVp::new(state);
    let mut dev = TestDevice::default();
    dev.io_read_value = 0x77;

    let exit = IoExit {
        string: true,
        address_size: 4,
        ..io_exit(IoDirection::In, 1)
    };
    assist_io(&mut vp, &mem, &mut dev, &exit).unwrap();

    assert_eq!(mem.read_bytes(BUF_PA + 0x100, 1), vec![0x77]);
    assert_eq!(vp.state.gps[RDI], BUF_VA + 1);
}

#[test]
fn string_df_decrements_index() {
    let (mem, mut vp) = string_setup();
    let mut dev = TestDevice::default();
    vp.state.gps[RDI] = BUF_VA + 4;
    vp.state.rflags = vp.state.rflags.with_direction(true);
    dev.io_read_value = 0x1234;

    let exit = IoExit {
        string: true,
        ..io_exit(IoDirection::In, 2)
    };
    assist_io(&mut vp, &mem, &mut dev, &exit).unwrap();

    assert_eq!(mem.read_bytes(BUF_PA + 4, 2), vec![0x34, 0x12]);
    assert_eq!(vp.state.gps[RDI], BUF_VA + 2);
}
