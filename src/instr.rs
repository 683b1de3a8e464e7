//! Minimal structural instruction model, the fragment under
//! construction, and the spill/restore recognizer.
//!
//! The decoder/encoder collaborator is external; this crate only needs
//! "an instruction" with enough shape to (a) construct spill/restore
//! code and (b) recognize such code later. Recognition is structural:
//! it matches the TLS-segment-relative addressing pattern and the
//! preservation-slot displacement range, never any provenance tag, so
//! it stays correct if instructions are copied or relocated as long as
//! the addressing pattern is preserved.

use crate::tls::InstruTls;
use crate::{Inst, Reg, SegReg, TlsSlot};

/// A segment-relative memory operand: `seg:[disp]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemArg {
    pub seg: SegReg,
    pub disp: u32,
}

impl std::fmt::Display for MemArg {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:[{:#x}]", self.seg, self.disp)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstrKind {
    /// Store a register to memory.
    Store,
    /// Load a register from memory.
    Load,
    /// Save the flags register to memory.
    SaveFlags,
    /// Restore the flags register from memory.
    RestoreFlags,
    /// A control transfer; control may leave the fragment here.
    Branch,
    /// Anything else (application or analysis instruction); opaque.
    Other,
}

/// One instruction in a fragment. Only the shape relevant to spill
/// recognition is modeled; everything else is `Other`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instr {
    kind: InstrKind,
    reg: Reg,
    mem: Option<MemArg>,
}

impl Instr {
    #[inline(always)]
    pub fn store(reg: Reg, mem: MemArg) -> Self {
        Instr {
            kind: InstrKind::Store,
            reg,
            mem: Some(mem),
        }
    }

    #[inline(always)]
    pub fn load(reg: Reg, mem: MemArg) -> Self {
        Instr {
            kind: InstrKind::Load,
            reg,
            mem: Some(mem),
        }
    }

    #[inline(always)]
    pub fn save_flags(mem: MemArg) -> Self {
        Instr {
            kind: InstrKind::SaveFlags,
            reg: Reg::invalid(),
            mem: Some(mem),
        }
    }

    #[inline(always)]
    pub fn restore_flags(mem: MemArg) -> Self {
        Instr {
            kind: InstrKind::RestoreFlags,
            reg: Reg::invalid(),
            mem: Some(mem),
        }
    }

    #[inline(always)]
    pub fn branch() -> Self {
        Instr {
            kind: InstrKind::Branch,
            reg: Reg::invalid(),
            mem: None,
        }
    }

    #[inline(always)]
    pub fn other() -> Self {
        Instr {
            kind: InstrKind::Other,
            reg: Reg::invalid(),
            mem: None,
        }
    }

    #[inline(always)]
    pub fn kind(&self) -> InstrKind {
        self.kind
    }

    #[inline(always)]
    pub fn reg(&self) -> Reg {
        self.reg
    }

    #[inline(always)]
    pub fn mem(&self) -> Option<MemArg> {
        self.mem
    }

    #[inline(always)]
    pub fn is_branch(&self) -> bool {
        self.kind == InstrKind::Branch
    }
}

impl std::fmt::Display for Instr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.kind {
            InstrKind::Store => write!(f, "store {} -> {}", self.reg, self.mem.unwrap()),
            InstrKind::Load => write!(f, "load {} <- {}", self.reg, self.mem.unwrap()),
            InstrKind::SaveFlags => write!(f, "save-flags -> {}", self.mem.unwrap()),
            InstrKind::RestoreFlags => write!(f, "restore-flags <- {}", self.mem.unwrap()),
            InstrKind::Branch => write!(f, "branch"),
            InstrKind::Other => write!(f, "app"),
        }
    }
}

/// The fragment of instrumentation code under construction: an ordered
/// instruction list with insert-before-point support. Owned by the
/// code generator building one fragment and discarded when the
/// fragment is finalized.
#[derive(Clone, Debug, Default)]
pub struct InstrList {
    instrs: Vec<Instr>,
}

impl InstrList {
    pub fn new() -> Self {
        InstrList { instrs: Vec::new() }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// The current append position: inserting before the cursor
    /// appends to the list.
    #[inline(always)]
    pub fn cursor(&self) -> Inst {
        Inst::new(self.instrs.len())
    }

    #[inline(always)]
    pub fn push(&mut self, instr: Instr) -> Inst {
        let at = Inst::new(self.instrs.len());
        self.instrs.push(instr);
        at
    }

    /// Insert `instr` immediately before position `before`. Positions
    /// at or after `before` shift by one; the caller is responsible
    /// for not reusing stale positions.
    pub fn insert_before(&mut self, before: Inst, instr: Instr) -> Inst {
        debug_assert!(before.index() <= self.instrs.len());
        self.instrs.insert(before.index(), instr);
        before
    }

    #[inline(always)]
    pub fn iter(&self) -> impl Iterator<Item = &Instr> {
        self.instrs.iter()
    }
}

impl std::ops::Index<Inst> for InstrList {
    type Output = Instr;
    #[inline(always)]
    fn index(&self, at: Inst) -> &Instr {
        &self.instrs[at.index()]
    }
}

/// If `mem` addresses a register-preservation slot in the configured
/// TLS segment, the slot.
#[inline]
fn preservation_slot(tls: &InstruTls, mem: MemArg) -> Option<TlsSlot> {
    if mem.seg != tls.seg() {
        return None;
    }
    TlsSlot::from_offset(mem.disp).filter(|slot| slot.is_spill_slot())
}

/// Whether `instr` stores a register's value into a preservation TLS
/// slot; if so, the spilled register.
pub fn instr_is_spill(tls: &InstruTls, instr: &Instr) -> Option<Reg> {
    if instr.kind() != InstrKind::Store {
        return None;
    }
    let mem = instr.mem()?;
    preservation_slot(tls, mem)?;
    Some(instr.reg())
}

/// Whether `instr` loads a register's value back from a preservation
/// TLS slot; if so, the restored register.
pub fn instr_is_restore(tls: &InstruTls, instr: &Instr) -> Option<Reg> {
    if instr.kind() != InstrKind::Load {
        return None;
    }
    let mem = instr.mem()?;
    preservation_slot(tls, mem)?;
    Some(instr.reg())
}

/// Whether `instr` saves the flags register into a preservation slot.
pub fn instr_is_aflags_spill(tls: &InstruTls, instr: &Instr) -> bool {
    instr.kind() == InstrKind::SaveFlags
        && instr.mem().map_or(false, |mem| preservation_slot(tls, mem).is_some())
}

/// Whether `instr` restores the flags register from a preservation
/// slot.
pub fn instr_is_aflags_restore(tls: &InstruTls, instr: &Instr) -> bool {
    instr.kind() == InstrKind::RestoreFlags
        && instr.mem().map_or(false, |mem| preservation_slot(tls, mem).is_some())
}

/// The external decoder collaborator: materializes the instruction at
/// a code address so already-emitted code can be inspected in place.
pub trait InstrDecoder {
    fn decode(&self, pc: u64) -> Option<Instr>;
}

/// Decodes the instruction at `pc` and answers the restore question.
/// Used by the fault-translation collaborator when presenting a
/// faulting program counter inside instrumentation code in terms of
/// the original application instruction.
pub fn instr_at_pc_is_restore(tls: &InstruTls, decoder: &dyn InstrDecoder, pc: u64) -> bool {
    match decoder.decode(pc) {
        Some(instr) => instr_is_restore(tls, &instr).is_some(),
        None => false,
    }
}
