// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mock guest memory, device and virtual processor shared by the
//! integration tests, plus page table builders for the three paging
//! formats.

#![allow(dead_code)]

use std::cell::RefCell;
use std::convert::Infallible;
use x86assist::addr::Gpa;
use x86assist::addr::Hva;
use x86assist::cpu::AssistVp;
use x86assist::cpu::DeviceIo;
use x86assist::cpu::GuestMemory;
use x86assist::cpu::Mapping;
use x86assist::cpu::NotMapped;
use x86assist::cpu::Prot;
use x86assist::registers::RegisterSets;
use x86assist::registers::VpState;
use x86defs::Pte;
use x86defs::SegmentAttributes;
use x86defs::SegmentRegister;
use x86defs::X64_CR0_PE;
use x86defs::X64_CR0_PG;
use x86defs::X64_CR4_PAE;
use x86defs::X64_CR4_PSE;
use x86defs::X64_EFER_LMA;
use x86defs::X64_EFER_LME;
use x86defs::X64_EFER_NXE;

/// A flat range of guest RAM starting at physical address zero.
pub struct TestMemory {
    mem: RefCell<Vec<u8>>,
}

impl TestMemory {
    pub fn new(size: usize) -> Self {
        Self {
            mem: RefCell::new(vec![0; size]),
        }
    }

    pub fn write_bytes(&self, gpa: u64, data: &[u8]) {
        self.mem.borrow_mut()[gpa as usize..][..data.len()].copy_from_slice(data);
    }

    pub fn read_bytes(&self, gpa: u64, len: usize) -> Vec<u8> {
        self.mem.borrow()[gpa as usize..][..len].to_vec()
    }

    pub fn write_u64(&self, gpa: u64, value: u64) {
        self.write_bytes(gpa, &value.to_le_bytes());
    }

    pub fn read_u64(&self, gpa: u64) -> u64 {
        let mut data = [0; 8];
        data.copy_from_slice(&self.read_bytes(gpa, 8));
        u64::from_le_bytes(data)
    }

    pub fn write_u32(&self, gpa: u64, value: u32) {
        self.write_bytes(gpa, &value.to_le_bytes());
    }
}

impl GuestMemory for TestMemory {
    fn lookup(&self, gpa: Gpa) -> Result<Mapping, NotMapped> {
        if (gpa.addr() as usize) < self.mem.borrow().len() {
            Ok(Mapping {
                hva: Hva::new(0x7f80_0000_0000 + gpa.addr()),
                prot: Prot::ALL,
            })
        } else {
            Err(NotMapped(gpa))
        }
    }

    fn read(&self, gpa: Gpa, data: &mut [u8]) -> Result<(), NotMapped> {
        let mem = self.mem.borrow();
        let start = gpa.addr() as usize;
        if start + data.len() > mem.len() {
            return Err(NotMapped(gpa));
        }
        data.copy_from_slice(&mem[start..start + data.len()]);
        Ok(())
    }

    fn write(&self, gpa: Gpa, data: &[u8]) -> Result<(), NotMapped> {
        let mut mem = self.mem.borrow_mut();
        let start = gpa.addr() as usize;
        if start + data.len() > mem.len() {
            return Err(NotMapped(gpa));
        }
        mem[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// A device that serves fixed values and logs every access.
#[derive(Default)]
pub struct TestDevice {
    pub mmio_read_value: u64,
    pub mmio_reads: Vec<(Gpa, usize)>,
    pub mmio_writes: Vec<(Gpa, Vec<u8>)>,
    pub io_read_value: u32,
    pub io_reads: Vec<(u16, usize)>,
    pub io_writes: Vec<(u16, Vec<u8>)>,
}

impl DeviceIo for TestDevice {
    fn read_mmio(&mut self, gpa: Gpa, data: &mut [u8]) {
        let value = self.mmio_read_value.to_le_bytes();
        let len = data.len();
        data.copy_from_slice(&value[..len]);
        self.mmio_reads.push((gpa, len));
    }

    fn write_mmio(&mut self, gpa: Gpa, data: &[u8]) {
        self.mmio_writes.push((gpa, data.to_vec()));
    }

    fn read_io(&mut self, port: u16, data: &mut [u8]) {
        let value = self.io_read_value.to_le_bytes();
        let len = data.len();
        data.copy_from_slice(&value[..len]);
        self.io_reads.push((port, len));
    }

    fn write_io(&mut self, port: u16, data: &[u8]) {
        self.io_writes.push((port, data.to_vec()));
    }
}

/// Register access that records write-backs.
pub struct TestVp {
    pub state: VpState,
    pub set_calls: usize,
    pub last_set_mask: Option<RegisterSets>,
}

impl TestVp {
    pub fn new(state: VpState) -> Self {
        Self {
            state,
            set_calls: 0,
            last_set_mask: None,
        }
    }
}

impl AssistVp for TestVp {
    type Error = Infallible;

    fn get_state(&mut self, _sets: RegisterSets) -> Result<VpState, Infallible> {
        Ok(self.state.clone())
    }

    fn set_state(&mut self, state: &VpState, sets: RegisterSets) -> Result<(), Infallible> {
        self.state = state.clone();
        self.set_calls += 1;
        self.last_set_mask = Some(sets);
        Ok(())
    }
}

/// Bump allocator for page table pages.
pub struct TablePool {
    next: u64,
}

impl TablePool {
    pub fn new(base: u64) -> Self {
        Self { next: base }
    }

    pub fn alloc(&mut self) -> u64 {
        let table = self.next;
        self.next += 0x1000;
        table
    }
}

pub fn full_pte() -> Pte {
    Pte::new()
        .with_present(true)
        .with_read_write(true)
        .with_user(true)
}

/// Maps one 4 KiB page in a 4-level long mode hierarchy rooted at
/// `cr3`, creating intermediate tables from `pool` as needed. Returns
/// the physical address of the entry written at each level so tests can
/// doctor individual entries afterwards.
pub fn map_long(
    mem: &TestMemory,
    pool: &mut TablePool,
    cr3: u64,
    va: u64,
    pa: u64,
    leaf: Pte,
) -> [u64; 4] {
    let mut table = cr3;
    let mut entries = [0; 4];
    for (i, shift) in [39u32, 30, 21, 12].into_iter().enumerate() {
        let entry_gpa = table + ((va >> shift) & 0x1ff) * 8;
        entries[i] = entry_gpa;
        if shift == 12 {
            mem.write_u64(entry_gpa, leaf.with_address(pa).into());
        } else {
            let existing = Pte::from(mem.read_u64(entry_gpa));
            table = if existing.present() {
                existing.address()
            } else {
                let next = pool.alloc();
                mem.write_u64(entry_gpa, full_pte().with_address(next).into());
                next
            };
        }
    }
    entries
}

/// Maps one 4 KiB page in a 3-level PAE hierarchy. `cr3` points at the
/// 4-entry page directory pointer table.
pub fn map_pae(
    mem: &TestMemory,
    pool: &mut TablePool,
    cr3: u64,
    va: u64,
    pa: u64,
    leaf: Pte,
) -> [u64; 3] {
    let mut entries = [0; 3];
    let pdpte_gpa = cr3 + ((va >> 30) & 0x3) * 8;
    entries[0] = pdpte_gpa;
    let mut table = {
        let existing = Pte::from(mem.read_u64(pdpte_gpa));
        if existing.present() {
            existing.address()
        } else {
            let next = pool.alloc();
            mem.write_u64(pdpte_gpa, Pte::new().with_present(true).with_address(next).into());
            next
        }
    };
    for (i, shift) in [21u32, 12].into_iter().enumerate() {
        let entry_gpa = table + ((va >> shift) & 0x1ff) * 8;
        entries[i + 1] = entry_gpa;
        if shift == 12 {
            mem.write_u64(entry_gpa, leaf.with_address(pa).into());
        } else {
            let existing = Pte::from(mem.read_u64(entry_gpa));
            table = if existing.present() {
                existing.address()
            } else {
                let next = pool.alloc();
                mem.write_u64(entry_gpa, full_pte().with_address(next).into());
                next
            };
        }
    }
    entries
}

/// Maps one 4 KiB page in a 2-level 32-bit hierarchy of 4-byte entries.
pub fn map_32(
    mem: &TestMemory,
    pool: &mut TablePool,
    cr3: u64,
    va: u64,
    pa: u64,
    leaf: Pte,
) -> [u64; 2] {
    let va = va as u32 as u64;
    let pde_gpa = cr3 + ((va >> 22) & 0x3ff) * 4;
    let existing = Pte::from(mem.read_u64(pde_gpa) & 0xffff_ffff);
    let table = if existing.present() {
        existing.address()
    } else {
        let next = pool.alloc();
        mem.write_u32(pde_gpa, u64::from(full_pte().with_address(next)) as u32);
        next
    };
    let pte_gpa = table + ((va >> 12) & 0x3ff) * 4;
    mem.write_u32(pte_gpa, u64::from(leaf.with_address(pa)) as u32);
    [pde_gpa, pte_gpa]
}

/// Rewrites one page table entry in place.
pub fn update_pte(mem: &TestMemory, entry_gpa: u64, f: impl FnOnce(Pte) -> Pte) {
    let pte = Pte::from(mem.read_u64(entry_gpa));
    mem.write_u64(entry_gpa, f(pte).into());
}

pub fn flat_segment() -> SegmentRegister {
    SegmentRegister {
        base: 0,
        limit: 0xfffff,
        selector: 0,
        attributes: SegmentAttributes::new()
            .with_present(true)
            .with_non_system_segment(true)
            .with_default(true)
            .with_granularity(true),
    }
}

pub fn long_mode_state(cr3: u64) -> VpState {
    let mut state = VpState::default();
    state.cr0 = X64_CR0_PE | X64_CR0_PG;
    state.cr3 = cr3;
    state.cr4 = X64_CR4_PAE;
    state.efer = X64_EFER_LME | X64_EFER_LMA | X64_EFER_NXE;
    state.segs = [flat_segment(); 6];
    state.segs[1].attributes = SegmentAttributes::new()
        .with_present(true)
        .with_non_system_segment(true)
        .with_long(true);
    state
}

pub fn pae_state(cr3: u64) -> VpState {
    let mut state = VpState::default();
    state.cr0 = X64_CR0_PE | X64_CR0_PG;
    state.cr3 = cr3;
    state.cr4 = X64_CR4_PAE;
    state.efer = X64_EFER_NXE;
    state.segs = [flat_segment(); 6];
    state
}

pub fn legacy32_state(cr3: u64, pse: bool) -> VpState {
    let mut state = VpState::default();
    state.cr0 = X64_CR0_PE | X64_CR0_PG;
    state.cr3 = cr3;
    state.cr4 = if pse { X64_CR4_PSE } else { 0 };
    state.segs = [flat_segment(); 6];
    state
}
