// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The already-classified exit records an assist call consumes. The
//! caller (or the kernel on its behalf) fills these in from the raw
//! vmexit before invoking the assist.

use crate::addr::Gpa;
use crate::fetch::MAX_INSTRUCTION_LEN;
use crate::registers::Segment;

/// An MMIO exit: the guest touched an unmapped or device-backed
/// physical page.
#[derive(Debug, Clone)]
pub struct MemoryExit {
    /// The faulting guest physical address, for diagnostics. Operand
    /// resolution recomputes the target from the decoded instruction.
    pub gpa: Gpa,
    /// Instruction bytes captured by hardware, if any. A zero length
    /// means none were captured and the assist fetches them itself.
    pub instruction_bytes: [u8; MAX_INSTRUCTION_LEN],
    pub instruction_len: u8,
}

impl MemoryExit {
    pub fn new(gpa: Gpa) -> Self {
        Self {
            gpa,
            instruction_bytes: [0; MAX_INSTRUCTION_LEN],
            instruction_len: 0,
        }
    }

    /// Attaches the hardware-captured instruction bytes. Panics if the
    /// slice exceeds [`MAX_INSTRUCTION_LEN`].
    pub fn with_instruction_bytes(mut self, bytes: &[u8]) -> Self {
        assert!(bytes.len() <= MAX_INSTRUCTION_LEN);
        self.instruction_bytes[..bytes.len()].copy_from_slice(bytes);
        self.instruction_len = bytes.len() as u8;
        self
    }

    pub fn captured_bytes(&self) -> Option<&[u8]> {
        if self.instruction_len > 0 {
            Some(&self.instruction_bytes[..self.instruction_len as usize])
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    In,
    Out,
}

/// A port I/O exit. Hardware decodes enough of IN/OUT/INS/OUTS that no
/// instruction fetch is needed; `next_rip` is the post-instruction PC
/// it reports.
#[derive(Debug, Clone)]
pub struct IoExit {
    pub direction: IoDirection,
    pub port: u16,
    /// Access width in bytes: 1, 2 or 4.
    pub operand_size: u8,
    /// Width of the index and count registers in bytes: 2, 4 or 8.
    pub address_size: u8,
    /// Segment for the source of a string OUT. String IN always stores
    /// through ES.
    pub segment: Segment,
    pub rep: bool,
    pub string: bool,
    pub next_rip: u64,
}
