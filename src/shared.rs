//! Shared-register coordinator: the whole-basic-block optimization
//! layer over the per-site reservation protocol.
//!
//! Reserving and restoring at every use site costs a spill/restore
//! pair per site and lets the block's register-allocation shape vary
//! site to site, which complicates translating a faulting program
//! counter inside a check back to original application semantics.
//! With whole-bb spilling enabled, one register is reserved for the
//! entire block, threaded through every use site, and released once
//! at block end: exactly one spill and one restore per block no
//! matter how many sites use it.

use crate::instr::InstrList;
use crate::reserve::{try_reserve_register, try_unreserve_register, BuildContext};
use crate::tls::InstruTls;
use crate::{assert_reserved, Inst, Reg, RegSet, ReserveError};

/// Per-basic-block state: the single shared register (when the
/// optimization is active for this block) and the block's end marker,
/// so a shared reservation can be checked against outliving its
/// block.
#[derive(Debug, Default)]
pub struct BlockInfo {
    shared_reg: Option<Reg>,
    block_end: Option<Inst>,
}

impl BlockInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// The block's shared register, if one is currently held.
    #[inline(always)]
    pub fn shared_reg(&self) -> Option<Reg> {
        self.shared_reg
    }

    /// Record where the block's instrumentation ends, once known; the
    /// shared restore must not be placed past this point.
    pub fn set_block_end(&mut self, end: Inst) {
        self.block_end = Some(end);
    }
}

/// Whether the whole-bb spilling mode is on. A pure configuration
/// toggle: it trades per-site register choice for block-wide
/// consistency, and nothing here enables it automatically.
#[inline(always)]
pub fn whole_bb_spills_enabled(tls: &InstruTls) -> bool {
    tls.whole_bb_spills_enabled()
}

/// Reserve the block's shared register. The first call behaves like a
/// per-site reservation and records the result in the block state;
/// every later call before the matching unreserve returns the
/// identical register with no further spill. Fatal if whole-bb
/// spilling is disabled.
pub fn reserve_shared_register(
    tls: &InstruTls,
    ilist: &mut InstrList,
    before: Inst,
    allowed: RegSet,
    ctx: &mut BuildContext,
    bi: &mut BlockInfo,
) -> Reg {
    assert_reserved(try_reserve_shared_register(
        tls, ilist, before, allowed, ctx, bi,
    ))
}

fn try_reserve_shared_register(
    tls: &InstruTls,
    ilist: &mut InstrList,
    before: Inst,
    allowed: RegSet,
    ctx: &mut BuildContext,
    bi: &mut BlockInfo,
) -> Result<Reg, ReserveError> {
    if !tls.whole_bb_spills_enabled() {
        return Err(ReserveError::SharedDisabled);
    }
    if let Some(reg) = bi.shared_reg {
        debug_assert_eq!(ctx.shared(), Some(reg));
        trace!("reserve_shared_register: reusing {}", reg);
        return Ok(reg);
    }
    let reg = try_reserve_register(tls, ilist, before, allowed, ctx)?;
    bi.shared_reg = Some(reg);
    ctx.set_shared(Some(reg));
    trace!("reserve_shared_register: {} for whole bb", reg);
    Ok(reg)
}

/// Release the block's shared register, once, at the natural end of
/// the block's instrumentation: after the last use site and before
/// any branch back to application code or to the next block. Emits
/// the block's single restore. Fatal if no shared reservation is
/// held.
pub fn unreserve_shared_register(
    tls: &InstruTls,
    ilist: &mut InstrList,
    before: Inst,
    ctx: &mut BuildContext,
    bi: &mut BlockInfo,
) {
    assert_reserved(try_unreserve_shared_register(tls, ilist, before, ctx, bi))
}

fn try_unreserve_shared_register(
    tls: &InstruTls,
    ilist: &mut InstrList,
    before: Inst,
    ctx: &mut BuildContext,
    bi: &mut BlockInfo,
) -> Result<(), ReserveError> {
    let reg = bi.shared_reg.take().ok_or(ReserveError::SharedNotHeld)?;
    if let Some(end) = bi.block_end {
        debug_assert!(
            before.index() <= end.index(),
            "shared restore placed past block end"
        );
    }
    ctx.set_shared(None);
    trace!("unreserve_shared_register: {}", reg);
    try_unreserve_register(tls, ilist, before, reg, ctx, true)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::instr::{instr_is_restore, instr_is_spill, Instr};
    use crate::reserve::{reserve_register, unreserve_register};
    use crate::SegReg;

    fn tls() -> InstruTls {
        InstruTls::init(SegReg::Gs, true)
    }

    fn allowed(regs: &[usize]) -> RegSet {
        regs.iter().map(|&r| Reg::new(r)).collect()
    }

    fn count_spills_restores(tls: &InstruTls, ilist: &InstrList) -> (usize, usize) {
        let spills = ilist
            .iter()
            .filter(|i| instr_is_spill(tls, i).is_some())
            .count();
        let restores = ilist
            .iter()
            .filter(|i| instr_is_restore(tls, i).is_some())
            .count();
        (spills, restores)
    }

    #[test]
    fn test_shared_register_stability() {
        let tls = tls();
        let mut ilist = InstrList::new();
        let mut ctx = BuildContext::new();
        let mut bi = BlockInfo::new();
        let set = allowed(&[1, 2, 3]);

        let cur = ilist.cursor();
        let first =
            reserve_shared_register(&tls, &mut ilist, cur, set, &mut ctx, &mut bi);
        // Five use sites in the same block all see the same register
        // with no further spills.
        for _ in 0..5 {
            ilist.push(Instr::other());
            let cur = ilist.cursor();
            let again =
                reserve_shared_register(&tls, &mut ilist, cur, set, &mut ctx, &mut bi);
            assert_eq!(again, first);
        }
        let cur = ilist.cursor();
        unreserve_shared_register(&tls, &mut ilist, cur, &mut ctx, &mut bi);

        let (spills, restores) = count_spills_restores(&tls, &ilist);
        assert_eq!((spills, restores), (1, 1));
        assert!(ctx.all_restored());
        assert_eq!(bi.shared_reg(), None);
    }

    #[test]
    fn test_shared_register_opaque_to_per_site_ops() {
        let tls = tls();
        let mut ilist = InstrList::new();
        let mut ctx = BuildContext::new();
        let mut bi = BlockInfo::new();
        let set = allowed(&[1, 2]);

        let cur = ilist.cursor();
        let shared =
            reserve_shared_register(&tls, &mut ilist, cur, set, &mut ctx, &mut bi);
        // A per-site reservation from the same allowed set must pick a
        // different register.
        let cur = ilist.cursor();
        let local = reserve_register(&tls, &mut ilist, cur, set, &mut ctx);
        assert_ne!(local, shared);
        let cur = ilist.cursor();
        unreserve_register(&tls, &mut ilist, cur, local, &mut ctx, true);
        let cur = ilist.cursor();
        unreserve_shared_register(&tls, &mut ilist, cur, &mut ctx, &mut bi);
    }

    #[test]
    #[should_panic(expected = "live shared register")]
    fn test_per_site_unreserve_of_shared_is_fatal() {
        let tls = tls();
        let mut ilist = InstrList::new();
        let mut ctx = BuildContext::new();
        let mut bi = BlockInfo::new();

        let cur = ilist.cursor();
        let shared = reserve_shared_register(
            &tls,
            &mut ilist,
            cur,
            allowed(&[1]),
            &mut ctx,
            &mut bi,
        );
        let cur = ilist.cursor();
        unreserve_register(&tls, &mut ilist, cur, shared, &mut ctx, true);
    }

    #[test]
    #[should_panic(expected = "whole-bb spilling disabled")]
    fn test_shared_reserve_requires_mode() {
        let tls = InstruTls::init(SegReg::Gs, false);
        let mut ilist = InstrList::new();
        let mut ctx = BuildContext::new();
        let mut bi = BlockInfo::new();
        let cur = ilist.cursor();
        let _ = reserve_shared_register(
            &tls,
            &mut ilist,
            cur,
            allowed(&[1]),
            &mut ctx,
            &mut bi,
        );
    }

    #[test]
    #[should_panic(expected = "no shared reservation")]
    fn test_shared_unreserve_without_reserve_is_fatal() {
        let tls = tls();
        let mut ilist = InstrList::new();
        let mut ctx = BuildContext::new();
        let mut bi = BlockInfo::new();
        let cur = ilist.cursor();
        unreserve_shared_register(&tls, &mut ilist, cur, &mut ctx, &mut bi);
    }
}
