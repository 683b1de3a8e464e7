//! Parity checker: verifies that a finished block's instrumentation
//! leaves no register reserved-but-not-restored at the point where
//! application code resumes.
//!
//! The walk covers the instructions between the start of
//! instrumentation and the first application branch point, pairing
//! every spill the recognizer finds with a later restore along that
//! path. Nothing is repaired here: a violation is a programming defect
//! in the instrumentation engine, and the debug entry point terminates
//! the run with a diagnostic rather than attempting recovery. Release
//! builds pay nothing; the check runs only at the end-of-fragment
//! checkpoint in debug builds.

use crate::instr::{
    instr_is_aflags_restore, instr_is_aflags_spill, instr_is_restore, instr_is_spill, InstrList,
};
use crate::tls::InstruTls;
use crate::{Inst, InstRange, Reg};
use rustc_hash::FxHashMap;

/// A single parity violation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParityError {
    /// `reg` was spilled at `spill_at` and never restored before the
    /// first application branch point.
    UnrestoredSpill { reg: Reg, spill_at: Inst },
    /// The flags were saved at `spill_at` and never restored.
    UnrestoredAflags { spill_at: Inst },
}

impl std::fmt::Display for ParityError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ParityError::UnrestoredSpill { reg, spill_at } => write!(
                f,
                "{} spilled at inst {} with no restore before app code resumes",
                reg,
                spill_at.index()
            ),
            ParityError::UnrestoredAflags { spill_at } => write!(
                f,
                "aflags saved at inst {} with no restore before app code resumes",
                spill_at.index()
            ),
        }
    }
}

/// The set of parity violations found in one fragment.
#[derive(Clone, Debug)]
pub struct ParityErrors {
    errors: Vec<ParityError>,
}

impl ParityErrors {
    pub fn errors(&self) -> &[ParityError] {
        &self.errors
    }
}

impl std::fmt::Display for ParityErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for error in &self.errors {
            writeln!(f, "{}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParityErrors {}

/// Walk the instructions from `instru_start` up to `app_instr` (the
/// first branch point after instrumentation begins) and report every
/// spill without a matching restore along that path. One violation per
/// unmatched register.
pub fn check_scratch_reg_parity(
    tls: &InstruTls,
    ilist: &InstrList,
    app_instr: Inst,
    instru_start: Inst,
) -> Result<(), ParityErrors> {
    let mut outstanding: FxHashMap<Reg, Inst> = FxHashMap::default();
    let mut aflags_at: Option<Inst> = None;

    for at in InstRange::forward(instru_start, app_instr).iter() {
        let instr = &ilist[at];
        if instr.is_branch() {
            // Control can reach application code from here; nothing
            // past this point can repair the balance on this path.
            break;
        }
        if let Some(reg) = instr_is_spill(tls, instr) {
            outstanding.entry(reg).or_insert(at);
        } else if let Some(reg) = instr_is_restore(tls, instr) {
            outstanding.remove(&reg);
        } else if instr_is_aflags_spill(tls, instr) {
            aflags_at.get_or_insert(at);
        } else if instr_is_aflags_restore(tls, instr) {
            aflags_at = None;
        }
    }

    let mut errors: Vec<ParityError> = outstanding
        .into_iter()
        .map(|(reg, spill_at)| ParityError::UnrestoredSpill { reg, spill_at })
        .collect();
    if let Some(spill_at) = aflags_at {
        errors.push(ParityError::UnrestoredAflags { spill_at });
    }
    // Deterministic report order regardless of hash iteration.
    errors.sort_by_key(|error| match error {
        ParityError::UnrestoredSpill { spill_at, .. } => spill_at.index(),
        ParityError::UnrestoredAflags { spill_at } => spill_at.index(),
    });

    if errors.is_empty() {
        Ok(())
    } else {
        trace!("scratch reg parity: {} violation(s)", errors.len());
        Err(ParityErrors { errors })
    }
}

/// Debug-build checkpoint invoked at end of fragment construction:
/// terminates the run with a diagnostic on any parity violation.
#[cfg(debug_assertions)]
pub fn debug_check_scratch_reg_parity(
    tls: &InstruTls,
    ilist: &InstrList,
    app_instr: Inst,
    instru_start: Inst,
) {
    if let Err(errors) = check_scratch_reg_parity(tls, ilist, app_instr, instru_start) {
        panic!("scratch register parity violation:\n{}", errors);
    }
}

#[cfg(not(debug_assertions))]
#[inline(always)]
pub fn debug_check_scratch_reg_parity(
    _tls: &InstruTls,
    _ilist: &InstrList,
    _app_instr: Inst,
    _instru_start: Inst,
) {
}
