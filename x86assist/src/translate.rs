// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest virtual to guest physical address translation: a software walk
//! of the guest's page tables in whichever of the three paging formats
//! the control registers select.

use crate::addr::Gpa;
use crate::addr::Gva;
use crate::cpu::GuestMemory;
use crate::cpu::NotMapped;
use crate::cpu::Prot;
use crate::registers::VpState;
use thiserror::Error;
use x86defs::Pte;
use x86defs::X64_CR0_PG;
use x86defs::X64_CR4_PAE;
use x86defs::X64_CR4_PSE;
use x86defs::X64_EFER_LMA;
use x86defs::X64_EFER_NXE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("non-canonical virtual address")]
    NonCanonicalAddress,
    #[error("page table entry not present")]
    NotPresent,
    #[error("large page at a level that does not support it")]
    UnexpectedLargePage,
    #[error("page table entry inaccessible")]
    EntryUnmapped(#[from] NotMapped),
}

/// What bit 7 of an entry means at a given walk level.
#[derive(Clone, Copy)]
enum LevelKind {
    /// A directory entry. `large` says whether a set page-size bit
    /// terminates the walk here; where it does not, a set bit is a
    /// malformed entry and the walk fails closed.
    Table { large: bool },
    /// The PAE page directory pointer entry. It carries no write/user
    /// bits; only present and NX are honored, and the page-size bit is
    /// reserved.
    PaeTop,
    /// The final level; bit 7 is PAT and ignored.
    Leaf,
}

#[derive(Clone, Copy)]
struct Level {
    index_bits: u32,
    kind: LevelKind,
}

/// Translates a guest virtual address under the paging mode currently
/// in force, returning the physical address and the permissions
/// accumulated across the walk.
///
/// Accessed and dirty bits are never updated, and no privilege check is
/// performed; the caller decides what to do with the returned
/// permissions.
pub fn translate_gva(
    state: &VpState,
    guest_memory: &impl GuestMemory,
    gva: Gva,
) -> Result<(Gpa, Prot), Error> {
    let long_mode = state.efer & X64_EFER_LMA != 0;
    let va = if long_mode {
        gva.addr()
    } else {
        gva.addr() as u32 as u64
    };

    if state.cr0 & X64_CR0_PG == 0 {
        return Ok((Gpa::new(va), Prot::ALL));
    }

    let (levels, wide, root): (&[Level], bool, u64) = if long_mode {
        if !is_canonical_address(va) {
            return Err(Error::NonCanonicalAddress);
        }
        const LONG: &[Level] = &[
            Level {
                index_bits: 9,
                kind: LevelKind::Table { large: false },
            },
            Level {
                index_bits: 9,
                kind: LevelKind::Table { large: true },
            },
            Level {
                index_bits: 9,
                kind: LevelKind::Table { large: true },
            },
            Level {
                index_bits: 9,
                kind: LevelKind::Leaf,
            },
        ];
        (LONG, true, state.cr3 & 0x000f_ffff_ffff_f000)
    } else if state.cr4 & X64_CR4_PAE != 0 {
        const PAE: &[Level] = &[
            Level {
                index_bits: 2,
                kind: LevelKind::PaeTop,
            },
            Level {
                index_bits: 9,
                kind: LevelKind::Table { large: true },
            },
            Level {
                index_bits: 9,
                kind: LevelKind::Leaf,
            },
        ];
        (PAE, true, state.cr3 & 0xffff_ffe0)
    } else {
        // 4 MiB pages require CR4.PSE; without it a set page-size bit
        // is malformed.
        let large = state.cr4 & X64_CR4_PSE != 0;
        let levels: &[Level] = if large {
            const PSE: &[Level] = &[
                Level {
                    index_bits: 10,
                    kind: LevelKind::Table { large: true },
                },
                Level {
                    index_bits: 10,
                    kind: LevelKind::Leaf,
                },
            ];
            PSE
        } else {
            const NO_PSE: &[Level] = &[
                Level {
                    index_bits: 10,
                    kind: LevelKind::Table { large: false },
                },
                Level {
                    index_bits: 10,
                    kind: LevelKind::Leaf,
                },
            ];
            NO_PSE
        };
        (levels, false, state.cr3 & 0xffff_f000)
    };

    // NX lives in bit 63, which only exists in the wide entry formats.
    let nx_enabled = wide && state.efer & X64_EFER_NXE != 0;

    let mut remaining_bits: u32 =
        levels.iter().map(|l| l.index_bits).sum::<u32>() + 12;
    let mut prot = Prot::ALL;
    let mut table = root;

    for level in levels {
        remaining_bits -= level.index_bits;
        let index = (va >> remaining_bits) & ((1 << level.index_bits) - 1);
        let entry_size = if wide { 8 } else { 4 };
        let entry_gpa = Gpa::new(table + index * entry_size);
        let entry = if wide {
            guest_memory.read_plain::<u64>(entry_gpa)?
        } else {
            guest_memory.read_plain::<u32>(entry_gpa)? as u64
        };
        let pte = Pte::from(entry);

        if !pte.present() {
            tracing::trace!(?gva, ?entry_gpa, "page not present");
            return Err(Error::NotPresent);
        }

        let terminal = match level.kind {
            LevelKind::PaeTop => {
                if pte.large_page() {
                    return Err(Error::UnexpectedLargePage);
                }
                if nx_enabled && pte.no_execute() {
                    prot.set_execute(false);
                }
                false
            }
            LevelKind::Leaf | LevelKind::Table { .. } => {
                if !pte.read_write() {
                    prot.set_write(false);
                }
                if !pte.user() {
                    prot.set_user(false);
                }
                if nx_enabled && pte.no_execute() {
                    prot.set_execute(false);
                }
                match level.kind {
                    LevelKind::Leaf => true,
                    LevelKind::Table { large } => {
                        if pte.large_page() {
                            if !large {
                                return Err(Error::UnexpectedLargePage);
                            }
                            true
                        } else {
                            false
                        }
                    }
                    LevelKind::PaeTop => unreachable!(),
                }
            }
        };

        if terminal {
            let address_mask = !0u64 << remaining_bits;
            let gpa = (pte.address() & address_mask) | (va & !address_mask);
            return Ok((Gpa::new(gpa), prot));
        }

        table = pte.address();
    }

    unreachable!("the final level always terminates the walk");
}

/// Translates and then checks the accumulated permissions against what
/// the access needs.
pub(crate) fn translate_checked<E>(
    state: &VpState,
    guest_memory: &impl GuestMemory,
    gva: Gva,
    required: Prot,
) -> Result<Gpa, crate::Error<E>> {
    let (gpa, prot) = translate_gva(state, guest_memory, gva)
        .map_err(|source| crate::Error::PageWalk { gva, source })?;
    if !prot.contains(required) {
        return Err(crate::Error::NoPermission {
            gva,
            required,
            actual: prot,
        });
    }
    Ok(gpa)
}

/// Checks that bits 63:47 of the address are uniform.
fn is_canonical_address(gva: u64) -> bool {
    let high_bits = (gva as i64) >> 47;
    high_bits == 0 || high_bits == -1
}
