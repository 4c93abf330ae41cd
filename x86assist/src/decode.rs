// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A hand-written decoder for the instruction forms that can fault on
//! device memory: the mov, or, and, xor, stos and lods families. The
//! decoder is an explicit state machine advanced by a single driver
//! loop over a byte cursor; the per-state handlers never call each
//! other.

use crate::registers::ExecMode;
use crate::registers::Gp;
use crate::registers::GpSize;
use crate::registers::RegisterIndex;
use crate::registers::Segment;
use bitfield_struct::bitfield;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported instruction {0:02x?}")]
    UnsupportedInstruction(Vec<u8>),
    #[error("not enough instruction bytes")]
    NotEnoughBytes,
}

#[bitfield(u8)]
#[derive(PartialEq, Eq)]
struct ModRmByte {
    #[bits(3)]
    rm: u8,
    #[bits(3)]
    reg: u8,
    #[bits(2)]
    mode: u8,
}

#[bitfield(u8)]
#[derive(PartialEq, Eq)]
struct SibByte {
    #[bits(3)]
    base: u8,
    #[bits(3)]
    index: u8,
    #[bits(2)]
    scale: u8,
}

/// The REX width-extension byte. Legal only in 64-bit mode.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct RexByte {
    pub b: bool,
    pub x: bool,
    pub r: bool,
    pub w: bool,
    #[bits(4)]
    _fixed: u8,
}

/// Legacy prefixes seen before the opcode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Prefixes {
    pub lock: bool,
    pub repz: bool,
    pub repnz: bool,
    pub segment: Option<Segment>,
    pub operand_size: bool,
    pub address_size: bool,
}

/// What the engine does with a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulOp {
    Mov,
    Or,
    And,
    Xor,
    Stos,
    Lods,
}

impl EmulOp {
    pub fn is_string(&self) -> bool {
        matches!(self, EmulOp::Stos | EmulOp::Lods)
    }
}

/// The base term of a memory operand's effective address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Base {
    None,
    Gp(Gp),
    Rip,
}

/// A ModRM/SIB memory operand, with the segment it resolves through
/// already selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub segment: Segment,
    pub base: Base,
    pub index: Option<Gp>,
    pub scale: u8,
    pub disp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(RegisterIndex),
    Imm(u64),
    Mem(MemOperand),
    /// A direct memory offset (the mov moffs forms).
    MemOffset { segment: Segment, offset: u64 },
}

/// A fully decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstr {
    pub prefixes: Prefixes,
    pub rex: Option<RexByte>,
    pub op: EmulOp,
    /// Operand width in bytes: 1, 2, 4 or 8.
    pub operand_size: u8,
    /// Address width in bytes: 2, 4 or 8.
    pub address_size: u8,
    pub source: Operand,
    pub dest: Operand,
    /// Total encoded length; always equal to the bytes consumed.
    pub len: u8,
}

impl DecodedInstr {
    /// Whether this instruction repeats under a rep prefix.
    pub fn rep_string(&self) -> bool {
        (self.prefixes.repz || self.prefixes.repnz) && self.op.is_string()
    }
}

#[derive(Clone, Copy)]
enum Direction {
    /// reg field is the source, rm (or moffs) the destination.
    RegToRm,
    /// rm (or moffs) is the source, reg field the destination.
    RmToReg,
}

#[derive(Clone, Copy)]
struct OpcodeEntry {
    op: EmulOp,
    dir: Direction,
    byte_op: bool,
    modrm: bool,
    moffs: bool,
    imm: bool,
}

impl OpcodeEntry {
    const fn modrm(op: EmulOp, dir: Direction, byte_op: bool) -> Self {
        Self {
            op,
            dir,
            byte_op,
            modrm: true,
            moffs: false,
            imm: false,
        }
    }
}

/// The single-byte opcode table. Anything absent is unsupported.
fn lookup(opcode: u8) -> Option<OpcodeEntry> {
    use Direction::*;
    use EmulOp::*;
    let entry = match opcode {
        0x08 => OpcodeEntry::modrm(Or, RegToRm, true),
        0x09 => OpcodeEntry::modrm(Or, RegToRm, false),
        0x0a => OpcodeEntry::modrm(Or, RmToReg, true),
        0x0b => OpcodeEntry::modrm(Or, RmToReg, false),
        0x20 => OpcodeEntry::modrm(And, RegToRm, true),
        0x21 => OpcodeEntry::modrm(And, RegToRm, false),
        0x22 => OpcodeEntry::modrm(And, RmToReg, true),
        0x23 => OpcodeEntry::modrm(And, RmToReg, false),
        0x30 => OpcodeEntry::modrm(Xor, RegToRm, true),
        0x31 => OpcodeEntry::modrm(Xor, RegToRm, false),
        0x32 => OpcodeEntry::modrm(Xor, RmToReg, true),
        0x33 => OpcodeEntry::modrm(Xor, RmToReg, false),
        0x88 => OpcodeEntry::modrm(Mov, RegToRm, true),
        0x89 => OpcodeEntry::modrm(Mov, RegToRm, false),
        0x8a => OpcodeEntry::modrm(Mov, RmToReg, true),
        0x8b => OpcodeEntry::modrm(Mov, RmToReg, false),
        0xa0 | 0xa1 | 0xa2 | 0xa3 => OpcodeEntry {
            op: Mov,
            dir: if opcode < 0xa2 { RmToReg } else { RegToRm },
            byte_op: opcode & 1 == 0,
            modrm: false,
            moffs: true,
            imm: false,
        },
        0xaa | 0xab => OpcodeEntry {
            op: Stos,
            dir: RegToRm,
            byte_op: opcode == 0xaa,
            modrm: false,
            moffs: false,
            imm: false,
        },
        0xac | 0xad => OpcodeEntry {
            op: Lods,
            dir: RmToReg,
            byte_op: opcode == 0xac,
            modrm: false,
            moffs: false,
            imm: false,
        },
        0xc6 | 0xc7 => OpcodeEntry {
            op: Mov,
            dir: RegToRm,
            byte_op: opcode == 0xc6,
            modrm: true,
            moffs: false,
            imm: true,
        },
        _ => return None,
    };
    Some(entry)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Prefixes,
    Rex,
    Opcode,
    ModRm,
    Sib,
    Displacement(u8),
    MemOffset,
    Immediate,
    Done,
}

/// Maps a 4-bit register encoding and an access width to a sized
/// register index, honoring the legacy high-byte aliasing: byte
/// encodings 4 through 7 without a REX byte name AH/CH/DH/BH, the
/// second byte of registers 0 through 3.
pub fn gp_from_encoding(encoding: u8, bytes: u8, rex_present: bool) -> RegisterIndex {
    if bytes == 1 && !rex_present && (4..8).contains(&encoding) {
        RegisterIndex::new(Gp::from_encoding(encoding - 4), GpSize::Byte(8))
    } else {
        RegisterIndex::sized(Gp::from_encoding(encoding), bytes)
    }
}

pub struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    mode: ExecMode,
    state: State,
    prefixes: Prefixes,
    rex: Option<RexByte>,
    entry: Option<OpcodeEntry>,
    operand_size: u8,
    address_size: u8,
    modrm: Option<ModRmByte>,
    sib: Option<SibByte>,
    disp: i64,
    mem_offset: u64,
    imm: u64,
}

impl<'a> Decoder<'a> {
    pub fn new(mode: ExecMode, bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            mode,
            state: State::Prefixes,
            prefixes: Prefixes::default(),
            rex: None,
            entry: None,
            operand_size: 0,
            address_size: 0,
            modrm: None,
            sib: None,
            disp: 0,
            mem_offset: 0,
            imm: 0,
        }
    }

    /// Runs the state machine to completion and builds the decoded
    /// instruction.
    pub fn run(mut self) -> Result<DecodedInstr, Error> {
        while self.state != State::Done {
            self.step()?;
        }
        self.finish()
    }

    fn step(&mut self) -> Result<(), Error> {
        match self.state {
            State::Prefixes => self.scan_prefix(),
            State::Rex => self.read_rex(),
            State::Opcode => self.read_opcode(),
            State::ModRm => self.read_modrm(),
            State::Sib => self.read_sib(),
            State::Displacement(size) => self.read_displacement(size),
            State::MemOffset => self.read_mem_offset(),
            State::Immediate => self.read_immediate(),
            State::Done => unreachable!(),
        }
    }

    fn peek(&self) -> Result<u8, Error> {
        self.bytes.get(self.pos).copied().ok_or(Error::NotEnoughBytes)
    }

    fn next(&mut self) -> Result<u8, Error> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn next_n(&mut self, n: usize) -> Result<u64, Error> {
        let mut value = 0;
        for i in 0..n {
            value |= (self.next()? as u64) << (i * 8);
        }
        Ok(value)
    }

    fn unsupported(&self) -> Error {
        Error::UnsupportedInstruction(self.bytes[..self.pos].to_vec())
    }

    fn scan_prefix(&mut self) -> Result<(), Error> {
        let byte = self.peek()?;
        let segment = match byte {
            0xf0 => {
                self.prefixes.lock = true;
                None
            }
            0xf2 => {
                self.prefixes.repnz = true;
                None
            }
            0xf3 => {
                self.prefixes.repz = true;
                None
            }
            0x66 => {
                self.prefixes.operand_size = true;
                None
            }
            0x67 => {
                self.prefixes.address_size = true;
                None
            }
            0x26 => Some(Segment::Es),
            0x2e => Some(Segment::Cs),
            0x36 => Some(Segment::Ss),
            0x3e => Some(Segment::Ds),
            0x64 => Some(Segment::Fs),
            0x65 => Some(Segment::Gs),
            _ => {
                self.state = State::Rex;
                return Ok(());
            }
        };
        if let Some(seg) = segment {
            self.prefixes.segment = Some(seg);
        }
        self.pos += 1;
        Ok(())
    }

    fn read_rex(&mut self) -> Result<(), Error> {
        if self.mode == ExecMode::Bit64 {
            let byte = self.peek()?;
            if (0x40..=0x4f).contains(&byte) {
                self.rex = Some(RexByte::from(byte));
                self.pos += 1;
            }
        }
        self.state = State::Opcode;
        Ok(())
    }

    fn read_opcode(&mut self) -> Result<(), Error> {
        let opcode = self.next()?;
        let entry = lookup(opcode).ok_or_else(|| self.unsupported())?;
        self.operand_size = operand_size(&entry, self.mode, &self.prefixes, self.rex);
        self.address_size = address_size(self.mode, &self.prefixes);
        self.state = if entry.modrm {
            State::ModRm
        } else if entry.moffs {
            State::MemOffset
        } else {
            // The string forms have only implicit operands.
            State::Done
        };
        self.entry = Some(entry);
        Ok(())
    }

    fn read_modrm(&mut self) -> Result<(), Error> {
        let modrm = ModRmByte::from(self.next()?);
        // The immediate forms share their opcode across a /r group; only
        // /0 is mov.
        if self.entry.map(|e| e.imm) == Some(true) && modrm.reg() != 0 {
            return Err(self.unsupported());
        }
        self.modrm = Some(modrm);
        self.state = if modrm.mode() != 3 && modrm.rm() == 4 {
            State::Sib
        } else {
            match displacement_size(modrm, None) {
                0 => self.after_displacement(),
                size => State::Displacement(size),
            }
        };
        Ok(())
    }

    fn read_sib(&mut self) -> Result<(), Error> {
        let sib = SibByte::from(self.next()?);
        self.sib = Some(sib);
        let modrm = self.modrm.unwrap_or_default();
        self.state = match displacement_size(modrm, Some(sib)) {
            0 => self.after_displacement(),
            size => State::Displacement(size),
        };
        Ok(())
    }

    fn read_displacement(&mut self, size: u8) -> Result<(), Error> {
        let raw = self.next_n(size as usize)?;
        self.disp = match size {
            1 => raw as u8 as i8 as i64,
            4 => raw as u32 as i32 as i64,
            _ => unreachable!(),
        };
        self.state = self.after_displacement();
        Ok(())
    }

    fn after_displacement(&self) -> State {
        if self.entry.map(|e| e.imm) == Some(true) {
            State::Immediate
        } else {
            State::Done
        }
    }

    fn read_mem_offset(&mut self) -> Result<(), Error> {
        self.mem_offset = self.next_n(self.address_size as usize)?;
        self.state = State::Done;
        Ok(())
    }

    fn read_immediate(&mut self) -> Result<(), Error> {
        // An 8-byte operand still takes a 4-byte immediate, sign
        // extended.
        let size = self.operand_size.min(4);
        let raw = self.next_n(size as usize)?;
        self.imm = match (size, self.operand_size) {
            (1, _) => raw,
            (2, _) => raw,
            (4, 8) => raw as u32 as i32 as i64 as u64,
            (4, _) => raw,
            _ => unreachable!(),
        };
        self.state = State::Done;
        Ok(())
    }

    fn finish(self) -> Result<DecodedInstr, Error> {
        let entry = match self.entry {
            Some(entry) => entry,
            None => return Err(self.unsupported()),
        };
        let rex_present = self.rex.is_some();
        let rex = self.rex.unwrap_or_default();
        let rax = gp_from_encoding(0, self.operand_size, rex_present);

        let (source, dest) = if entry.moffs {
            let mem = Operand::MemOffset {
                segment: self.prefixes.segment.unwrap_or(Segment::Ds),
                offset: self.mem_offset,
            };
            match entry.dir {
                Direction::RmToReg => (mem, Operand::Reg(rax)),
                Direction::RegToRm => (Operand::Reg(rax), mem),
            }
        } else if entry.op == EmulOp::Stos {
            // Always stores through ES:rDI; no override applies.
            let mem = Operand::Mem(MemOperand {
                segment: Segment::Es,
                base: Base::Gp(Gp::Rdi),
                index: None,
                scale: 1,
                disp: 0,
            });
            (Operand::Reg(rax), mem)
        } else if entry.op == EmulOp::Lods {
            let mem = Operand::Mem(MemOperand {
                segment: self.prefixes.segment.unwrap_or(Segment::Ds),
                base: Base::Gp(Gp::Rsi),
                index: None,
                scale: 1,
                disp: 0,
            });
            (mem, Operand::Reg(rax))
        } else {
            let modrm = match self.modrm {
                Some(modrm) => modrm,
                None => return Err(self.unsupported()),
            };
            let rm = if modrm.mode() == 3 {
                Operand::Reg(gp_from_encoding(
                    (rex.b() as u8) << 3 | modrm.rm(),
                    self.operand_size,
                    rex_present,
                ))
            } else {
                Operand::Mem(self.memory_operand(modrm, rex)?)
            };
            if entry.imm {
                (Operand::Imm(self.imm), rm)
            } else {
                let reg = Operand::Reg(gp_from_encoding(
                    (rex.r() as u8) << 3 | modrm.reg(),
                    self.operand_size,
                    rex_present,
                ));
                match entry.dir {
                    Direction::RegToRm => (reg, rm),
                    Direction::RmToReg => (rm, reg),
                }
            }
        };

        Ok(DecodedInstr {
            prefixes: self.prefixes,
            rex: self.rex,
            op: entry.op,
            operand_size: self.operand_size,
            address_size: self.address_size,
            source,
            dest,
            len: self.pos as u8,
        })
    }

    fn memory_operand(&self, modrm: ModRmByte, rex: RexByte) -> Result<MemOperand, Error> {
        // 16-bit effective addresses use a different ModRM table
        // entirely; no supported guest takes MMIO exits from such code.
        if self.address_size == 2 {
            return Err(self.unsupported());
        }

        let mut index = None;
        let mut scale = 1;
        let base = if modrm.rm() == 4 {
            let sib = self.sib.unwrap_or_default();
            scale = 1 << sib.scale();
            // Index encoding 4 without REX.X means no index; with REX.X
            // it names r12.
            if sib.index() != 4 || rex.x() {
                index = Some(Gp::from_encoding((rex.x() as u8) << 3 | sib.index()));
            }
            if sib.base() == 5 && modrm.mode() == 0 {
                Base::None
            } else {
                Base::Gp(Gp::from_encoding((rex.b() as u8) << 3 | sib.base()))
            }
        } else if modrm.rm() == 5 && modrm.mode() == 0 {
            if self.mode == ExecMode::Bit64 {
                Base::Rip
            } else {
                Base::None
            }
        } else {
            Base::Gp(Gp::from_encoding((rex.b() as u8) << 3 | modrm.rm()))
        };

        let segment = self.prefixes.segment.unwrap_or(match base {
            Base::Gp(Gp::Rbp) | Base::Gp(Gp::Rsp) => Segment::Ss,
            _ => Segment::Ds,
        });

        Ok(MemOperand {
            segment,
            base,
            index,
            scale,
            disp: self.disp,
        })
    }
}

/// Displacement size in bytes implied by the addressing mode.
fn displacement_size(modrm: ModRmByte, sib: Option<SibByte>) -> u8 {
    match modrm.mode() {
        0 => {
            if modrm.rm() == 5 {
                4
            } else if let Some(sib) = sib {
                if sib.base() == 5 {
                    4
                } else {
                    0
                }
            } else {
                0
            }
        }
        1 => 1,
        2 => 4,
        _ => 0,
    }
}

fn operand_size(
    entry: &OpcodeEntry,
    mode: ExecMode,
    prefixes: &Prefixes,
    rex: Option<RexByte>,
) -> u8 {
    if entry.byte_op {
        return 1;
    }
    match mode {
        ExecMode::Bit64 => {
            if rex.is_some_and(|r| r.w()) {
                8
            } else if prefixes.operand_size {
                2
            } else {
                4
            }
        }
        ExecMode::Bit32 => {
            if prefixes.operand_size {
                2
            } else {
                4
            }
        }
        ExecMode::Bit16 => {
            if prefixes.operand_size {
                4
            } else {
                2
            }
        }
    }
}

fn address_size(mode: ExecMode, prefixes: &Prefixes) -> u8 {
    match mode {
        ExecMode::Bit64 => {
            if prefixes.address_size {
                4
            } else {
                8
            }
        }
        ExecMode::Bit32 => {
            if prefixes.address_size {
                2
            } else {
                4
            }
        }
        ExecMode::Bit16 => {
            if prefixes.address_size {
                4
            } else {
                2
            }
        }
    }
}
