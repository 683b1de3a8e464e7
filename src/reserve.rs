//! Register reservation manager: the reserve/unreserve protocol for
//! general-purpose registers and for the flags register.
//!
//! A reservation is temporary, exclusive ownership of one register for
//! a bounded span of inserted instructions. Reserving spills the
//! displaced application value to a TLS preservation slot (unless the
//! register is known dead at that point); unreserving restores it,
//! either immediately or deferred so several restores can be batched
//! before the next branch. Every failure here is a fragment-design
//! defect, never a transient condition, so the public entry points
//! escalate to a fatal panic through the crate's single assert
//! adapter.

use crate::instr::{Instr, InstrList};
use crate::tls::InstruTls;
use crate::{
    assert_reserved, Inst, Reg, RegSet, ReserveError, TlsSlot, FIRST_SPILL_SLOT, NUM_TLS_SLOTS,
};
use smallvec::SmallVec;

#[derive(Clone, Copy, Debug)]
struct SpillPair {
    reg: Reg,
    slot: TlsSlot,
}

/// Mutable per-fragment state threaded through every reservation call:
/// which registers are currently reserved, which TLS slots are
/// occupied, and accumulated code-generation decisions. Owned by the
/// code generator building one fragment and discarded once that
/// fragment is finalized; never shared across threads.
#[derive(Debug, Default)]
pub struct BuildContext {
    /// Registers currently reserved (including the shared register
    /// while it is held).
    reserved: RegSet,
    /// Registers the engine's liveness analysis reports dead at the
    /// current point; reserving one of these needs no spill.
    dead: RegSet,
    /// The block's shared register, opaque to per-site operations
    /// while held.
    shared: Option<Reg>,
    /// Slot holding the saved flags, if flags are reserved.
    aflags_slot: Option<TlsSlot>,
    /// Live reservations whose application value sits in a slot.
    spills: SmallVec<[SpillPair; 4]>,
    /// Unreserved registers whose restore was deferred for batching.
    deferred: SmallVec<[SpillPair; 4]>,
    /// Occupancy bitmask over the TLS slot indices.
    slots_in_use: u32,
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the engine's dead-register hint for the current point
    /// in the fragment. Selection prefers these registers to avoid
    /// spilling an application value that is never needed again.
    pub fn set_dead_regs(&mut self, dead: RegSet) {
        self.dead = dead;
    }

    #[inline(always)]
    pub fn reserved(&self) -> RegSet {
        self.reserved
    }

    #[inline(always)]
    pub fn aflags_reserved(&self) -> bool {
        self.aflags_slot.is_some()
    }

    /// Whether any restore is still pending (deferred or live); at
    /// fragment end this must be false before application code can
    /// resume.
    pub fn all_restored(&self) -> bool {
        self.reserved.is_empty() && self.deferred.is_empty() && self.aflags_slot.is_none()
    }

    #[inline(always)]
    pub(crate) fn shared(&self) -> Option<Reg> {
        self.shared
    }

    #[inline(always)]
    pub(crate) fn set_shared(&mut self, shared: Option<Reg>) {
        self.shared = shared;
    }

    /// Slot currently preserving `reg`'s application value, if any.
    pub fn slot_for(&self, reg: Reg) -> Option<TlsSlot> {
        self.spills
            .iter()
            .chain(self.deferred.iter())
            .find(|pair| pair.reg == reg)
            .map(|pair| pair.slot)
    }

    fn alloc_slot(&mut self) -> Result<TlsSlot, ReserveError> {
        // Only the preservation range; the slowpath communication
        // slots below FIRST_SPILL_SLOT are never handed out here.
        for index in FIRST_SPILL_SLOT..NUM_TLS_SLOTS {
            if self.slots_in_use & (1 << index) == 0 {
                self.slots_in_use |= 1 << index;
                return Ok(TlsSlot::new(index));
            }
        }
        Err(ReserveError::NoFreeSlot)
    }

    fn free_slot(&mut self, slot: TlsSlot) {
        debug_assert!(self.slots_in_use & (1 << slot.index()) != 0);
        self.slots_in_use &= !(1 << slot.index());
    }

    #[cfg(debug_assertions)]
    fn validate(&self) {
        use hashbrown::HashSet;
        let mut seen_regs = HashSet::new();
        let mut seen_slots = HashSet::new();
        for pair in self.spills.iter().chain(self.deferred.iter()) {
            assert!(seen_regs.insert(pair.reg), "duplicate spill for {}", pair.reg);
            assert!(seen_slots.insert(pair.slot), "slot {} used twice", pair.slot);
            assert!(pair.slot.is_spill_slot());
            assert!(self.slots_in_use & (1 << pair.slot.index()) != 0);
        }
        if let Some(slot) = self.aflags_slot {
            assert!(seen_slots.insert(slot), "slot {} used twice", slot);
        }
    }

    #[cfg(not(debug_assertions))]
    fn validate(&self) {}
}

/// Reserve the flags register for exclusive use by code inserted at
/// `before`. There is no register to choose, so this always spills the
/// flags to a preservation slot. Reserving while already reserved is a
/// fatal contract violation.
pub fn reserve_aflags(tls: &InstruTls, ilist: &mut InstrList, before: Inst, ctx: &mut BuildContext) {
    assert_reserved(try_reserve_aflags(tls, ilist, before, ctx))
}

fn try_reserve_aflags(
    tls: &InstruTls,
    ilist: &mut InstrList,
    before: Inst,
    ctx: &mut BuildContext,
) -> Result<(), ReserveError> {
    if ctx.aflags_slot.is_some() {
        return Err(ReserveError::AflagsAlreadyReserved);
    }
    let slot = ctx.alloc_slot()?;
    ilist.insert_before(before, Instr::save_flags(tls.slot_opnd(slot)));
    ctx.aflags_slot = Some(slot);
    ctx.validate();
    trace!("reserve_aflags: saved to {}", slot);
    Ok(())
}

/// Restore the flags register and clear its occupancy. Unreserving
/// without a matching reserve is a fatal contract violation.
pub fn unreserve_aflags(
    tls: &InstruTls,
    ilist: &mut InstrList,
    before: Inst,
    ctx: &mut BuildContext,
) {
    assert_reserved(try_unreserve_aflags(tls, ilist, before, ctx))
}

fn try_unreserve_aflags(
    tls: &InstruTls,
    ilist: &mut InstrList,
    before: Inst,
    ctx: &mut BuildContext,
) -> Result<(), ReserveError> {
    let slot = ctx.aflags_slot.take().ok_or(ReserveError::AflagsNotReserved)?;
    ilist.insert_before(before, Instr::restore_flags(tls.slot_opnd(slot)));
    ctx.free_slot(slot);
    trace!("unreserve_aflags: restored from {}", slot);
    Ok(())
}

/// Reserve one register from `allowed` for exclusive use by code
/// inserted at `before`.
///
/// Selection prefers a register the engine reports dead at this point,
/// which saves both the spill of the application's value and the later
/// restore. If the chosen register holds a live application value, a
/// spill to a preservation slot is emitted immediately before
/// `before`. Re-reserving a register whose deferred restore has not
/// yet flushed revives its existing slot pair without a second spill.
/// Exhaustion of `allowed` is fatal: register pressure is statically
/// bounded by the fragment's design.
pub fn reserve_register(
    tls: &InstruTls,
    ilist: &mut InstrList,
    before: Inst,
    allowed: RegSet,
    ctx: &mut BuildContext,
) -> Reg {
    assert_reserved(try_reserve_register(tls, ilist, before, allowed, ctx))
}

pub(crate) fn try_reserve_register(
    tls: &InstruTls,
    ilist: &mut InstrList,
    before: Inst,
    allowed: RegSet,
    ctx: &mut BuildContext,
) -> Result<Reg, ReserveError> {
    let free = allowed & !ctx.reserved;
    let reg = match (free & ctx.dead).first() {
        Some(reg) => reg,
        None => free.first().ok_or(ReserveError::Exhausted { allowed })?,
    };
    if let Some(at) = ctx.deferred.iter().position(|pair| pair.reg == reg) {
        // A deferred restore means the application value already sits
        // in this register's slot; revive that pair rather than
        // spilling the instrumentation's own value over it.
        let pair = ctx.deferred.remove(at);
        ctx.spills.push(pair);
        trace!("reserve_register: {} revived pending spill in {}", reg, pair.slot);
    } else if !ctx.dead.contains(reg) {
        let slot = ctx.alloc_slot()?;
        ilist.insert_before(before, Instr::store(reg, tls.slot_opnd(slot)));
        ctx.spills.push(SpillPair { reg, slot });
        trace!("reserve_register: {} spilled to {}", reg, slot);
    } else {
        trace!("reserve_register: {} dead, no spill", reg);
    }
    ctx.reserved.insert(reg);
    ctx.validate();
    Ok(reg)
}

/// Clear the reservation of `reg`. With `force_restore_now` the
/// restore is emitted immediately at `before`; otherwise it is
/// deferred so the caller can batch several restores with
/// [`flush_deferred_restores`] before the next branch. Deferred
/// restores must be resolved before any point where application code
/// could observe register state. Unreserving a register that is not
/// reserved, or the block's live shared register, is a fatal contract
/// violation.
pub fn unreserve_register(
    tls: &InstruTls,
    ilist: &mut InstrList,
    before: Inst,
    reg: Reg,
    ctx: &mut BuildContext,
    force_restore_now: bool,
) {
    assert_reserved(try_unreserve_register(
        tls,
        ilist,
        before,
        reg,
        ctx,
        force_restore_now,
    ))
}

pub(crate) fn try_unreserve_register(
    tls: &InstruTls,
    ilist: &mut InstrList,
    before: Inst,
    reg: Reg,
    ctx: &mut BuildContext,
    force_restore_now: bool,
) -> Result<(), ReserveError> {
    if ctx.shared == Some(reg) {
        return Err(ReserveError::SharedHeld(reg));
    }
    if !ctx.reserved.contains(reg) {
        return Err(ReserveError::NotReserved(reg));
    }
    ctx.reserved.remove(reg);
    if let Some(at) = ctx.spills.iter().position(|pair| pair.reg == reg) {
        let pair = ctx.spills.remove(at);
        if force_restore_now {
            ilist.insert_before(before, Instr::load(pair.reg, tls.slot_opnd(pair.slot)));
            ctx.free_slot(pair.slot);
            trace!("unreserve_register: {} restored from {}", pair.reg, pair.slot);
        } else {
            ctx.deferred.push(pair);
            trace!("unreserve_register: {} restore deferred", pair.reg);
        }
    } else {
        trace!("unreserve_register: {} had no spill", reg);
    }
    ctx.validate();
    Ok(())
}

/// Materialize every deferred restore at `before`, in unreserve order.
/// The batching point: called once before the fragment's next branch
/// or before fragment end.
pub fn flush_deferred_restores(
    tls: &InstruTls,
    ilist: &mut InstrList,
    before: Inst,
    ctx: &mut BuildContext,
) {
    let pending: SmallVec<[SpillPair; 4]> = ctx.deferred.drain(..).collect();
    for pair in pending {
        ilist.insert_before(before, Instr::load(pair.reg, tls.slot_opnd(pair.slot)));
        ctx.free_slot(pair.slot);
        trace!("flush_deferred_restores: {} from {}", pair.reg, pair.slot);
    }
    ctx.validate();
}

/// Render `reg`'s current reservation state to a diagnostic sink,
/// tagged with `name`. Debug builds only; used when tracing a
/// misbehaving fragment by hand.
#[cfg(debug_assertions)]
pub fn print_scratch_reg(
    ctx: &BuildContext,
    reg: Reg,
    name: &str,
    out: &mut impl std::fmt::Write,
) -> std::fmt::Result {
    write!(out, "{} = {}:", name, reg)?;
    if ctx.shared == Some(reg) {
        write!(out, " shared")?;
    }
    if ctx.reserved.contains(reg) {
        write!(out, " reserved")?;
    } else {
        write!(out, " not reserved")?;
    }
    if let Some(pair) = ctx.spills.iter().find(|pair| pair.reg == reg) {
        write!(out, ", app value in {}", pair.slot)?;
    } else if let Some(pair) = ctx.deferred.iter().find(|pair| pair.reg == reg) {
        write!(out, ", restore pending from {}", pair.slot)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::instr::{instr_is_restore, instr_is_spill, InstrKind};
    use crate::SegReg;

    fn tls() -> InstruTls {
        InstruTls::init(SegReg::Gs, false)
    }

    fn allowed(regs: &[usize]) -> RegSet {
        regs.iter().map(|&r| Reg::new(r)).collect()
    }

    #[test]
    fn test_reserve_emits_recognizable_spill() {
        let tls = tls();
        let mut ilist = InstrList::new();
        let mut ctx = BuildContext::new();

        let cur = ilist.cursor();
        let reg = reserve_register(&tls, &mut ilist, cur, allowed(&[1, 2]), &mut ctx);
        assert_eq!(reg, Reg::new(1));
        assert_eq!(ilist.len(), 1);
        assert_eq!(instr_is_spill(&tls, &ilist[Inst::new(0)]), Some(reg));

        ilist.push(Instr::other()); // use site

        let cur = ilist.cursor();
        unreserve_register(&tls, &mut ilist, cur, reg, &mut ctx, true);
        assert_eq!(ilist.len(), 3);
        assert_eq!(instr_is_restore(&tls, &ilist[Inst::new(2)]), Some(reg));
        assert!(ctx.all_restored());
    }

    #[test]
    fn test_dead_register_skips_spill() {
        let tls = tls();
        let mut ilist = InstrList::new();
        let mut ctx = BuildContext::new();
        ctx.set_dead_regs(RegSet::empty().with(Reg::new(4)));

        let cur = ilist.cursor();
        let reg = reserve_register(&tls, &mut ilist, cur, allowed(&[1, 4]), &mut ctx);
        assert_eq!(reg, Reg::new(4));
        assert!(ilist.is_empty());

        let cur = ilist.cursor();
        unreserve_register(&tls, &mut ilist, cur, reg, &mut ctx, true);
        assert!(ilist.is_empty());
        assert!(ctx.all_restored());
    }

    #[test]
    fn test_mutual_exclusion() {
        let tls = tls();
        let mut ilist = InstrList::new();
        let mut ctx = BuildContext::new();
        let set = allowed(&[1, 2, 3]);

        let cur = ilist.cursor();
        let a = reserve_register(&tls, &mut ilist, cur, set, &mut ctx);
        let cur = ilist.cursor();
        let b = reserve_register(&tls, &mut ilist, cur, set, &mut ctx);
        let cur = ilist.cursor();
        let c = reserve_register(&tls, &mut ilist, cur, set, &mut ctx);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    #[should_panic(expected = "no unreserved register")]
    fn test_exhaustion_is_fatal() {
        let tls = tls();
        let mut ilist = InstrList::new();
        let mut ctx = BuildContext::new();
        let set = allowed(&[1]);

        let cur = ilist.cursor();
        let _ = reserve_register(&tls, &mut ilist, cur, set, &mut ctx);
        let cur = ilist.cursor();
        let _ = reserve_register(&tls, &mut ilist, cur, set, &mut ctx);
    }

    #[test]
    #[should_panic(expected = "not reserved")]
    fn test_unreserve_without_reserve_is_fatal() {
        let tls = tls();
        let mut ilist = InstrList::new();
        let mut ctx = BuildContext::new();
        let cur = ilist.cursor();
        unreserve_register(&tls, &mut ilist, cur, Reg::new(1), &mut ctx, true);
    }

    #[test]
    fn test_aflags_round_trip() {
        let tls = tls();
        let mut ilist = InstrList::new();
        let mut ctx = BuildContext::new();

        let cur = ilist.cursor();
        reserve_aflags(&tls, &mut ilist, cur, &mut ctx);
        assert!(ctx.aflags_reserved());
        assert_eq!(ilist[Inst::new(0)].kind(), InstrKind::SaveFlags);

        let cur = ilist.cursor();
        unreserve_aflags(&tls, &mut ilist, cur, &mut ctx);
        assert!(!ctx.aflags_reserved());
        assert_eq!(ilist[Inst::new(1)].kind(), InstrKind::RestoreFlags);
        assert!(ctx.all_restored());
    }

    #[test]
    #[should_panic(expected = "aflags reserved while already reserved")]
    fn test_double_aflags_reserve_is_fatal() {
        let tls = tls();
        let mut ilist = InstrList::new();
        let mut ctx = BuildContext::new();
        let cur = ilist.cursor();
        reserve_aflags(&tls, &mut ilist, cur, &mut ctx);
        let cur = ilist.cursor();
        reserve_aflags(&tls, &mut ilist, cur, &mut ctx);
    }

    #[test]
    #[should_panic(expected = "aflags unreserved")]
    fn test_aflags_unreserve_without_reserve_is_fatal() {
        let tls = tls();
        let mut ilist = InstrList::new();
        let mut ctx = BuildContext::new();
        let cur = ilist.cursor();
        unreserve_aflags(&tls, &mut ilist, cur, &mut ctx);
    }

    #[test]
    fn test_deferred_restores_batch() {
        let tls = tls();
        let mut ilist = InstrList::new();
        let mut ctx = BuildContext::new();
        let set = allowed(&[1, 2]);

        let cur = ilist.cursor();
        let a = reserve_register(&tls, &mut ilist, cur, set, &mut ctx);
        let cur = ilist.cursor();
        let b = reserve_register(&tls, &mut ilist, cur, set, &mut ctx);
        ilist.push(Instr::other());
        let before_unreserve = ilist.len();

        let cur = ilist.cursor();
        unreserve_register(&tls, &mut ilist, cur, a, &mut ctx, false);
        let cur = ilist.cursor();
        unreserve_register(&tls, &mut ilist, cur, b, &mut ctx, false);
        // Nothing emitted yet.
        assert_eq!(ilist.len(), before_unreserve);
        assert!(!ctx.all_restored());

        let cur = ilist.cursor();
        flush_deferred_restores(&tls, &mut ilist, cur, &mut ctx);
        assert_eq!(ilist.len(), before_unreserve + 2);
        assert_eq!(
            instr_is_restore(&tls, &ilist[Inst::new(before_unreserve)]),
            Some(a)
        );
        assert_eq!(
            instr_is_restore(&tls, &ilist[Inst::new(before_unreserve + 1)]),
            Some(b)
        );
        assert!(ctx.all_restored());
    }

    #[test]
    fn test_slowpath_slots_never_used_for_spills() {
        let tls = tls();
        let mut ilist = InstrList::new();
        let mut ctx = BuildContext::new();
        // Fill every preservation slot plus flags pressure; no slot
        // handed out may alias a slowpath slot.
        let cur = ilist.cursor();
        reserve_aflags(&tls, &mut ilist, cur, &mut ctx);
        for r in 1..=(NUM_TLS_SLOTS - FIRST_SPILL_SLOT - 1) {
            let cur = ilist.cursor();
            let reg =
                reserve_register(&tls, &mut ilist, cur, allowed(&[r]), &mut ctx);
            let slot = ctx.slot_for(reg).unwrap();
            assert!(slot.is_spill_slot());
        }
        for instr in ilist.iter() {
            let mem = instr.mem().unwrap();
            assert!(crate::TlsSlot::from_offset(mem.disp).unwrap().is_spill_slot());
        }
    }

    #[test]
    fn test_reserve_revives_deferred_spill() {
        let tls = tls();
        let mut ilist = InstrList::new();
        let mut ctx = BuildContext::new();
        let set = allowed(&[1]);

        let cur = ilist.cursor();
        let a = reserve_register(&tls, &mut ilist, cur, set, &mut ctx);
        let slot = ctx.slot_for(a).unwrap();
        let cur = ilist.cursor();
        unreserve_register(&tls, &mut ilist, cur, a, &mut ctx, false);

        // Re-reserving before the deferred restore flushes must reuse
        // the pending pair: no second spill, same slot.
        let cur = ilist.cursor();
        let b = reserve_register(&tls, &mut ilist, cur, set, &mut ctx);
        assert_eq!(b, a);
        assert_eq!(ctx.slot_for(b), Some(slot));
        let spills = ilist
            .iter()
            .filter(|i| instr_is_spill(&tls, i).is_some())
            .count();
        assert_eq!(spills, 1);

        let cur = ilist.cursor();
        unreserve_register(&tls, &mut ilist, cur, b, &mut ctx, true);
        let cur = ilist.cursor();
        flush_deferred_restores(&tls, &mut ilist, cur, &mut ctx);
        let restores = ilist
            .iter()
            .filter(|i| instr_is_restore(&tls, i).is_some())
            .count();
        assert_eq!(restores, 1);
        assert!(ctx.all_restored());
    }

    #[test]
    fn test_print_scratch_reg_states() {
        let tls = tls();
        let mut ilist = InstrList::new();
        let mut ctx = BuildContext::new();

        let cur = ilist.cursor();
        let reg = reserve_register(&tls, &mut ilist, cur, allowed(&[3]), &mut ctx);
        let slot = ctx.slot_for(reg).unwrap();
        let mut out = String::new();
        print_scratch_reg(&ctx, reg, "scratch", &mut out).unwrap();
        assert_eq!(out, format!("scratch = r3: reserved, app value in {}", slot));

        let cur = ilist.cursor();
        unreserve_register(&tls, &mut ilist, cur, reg, &mut ctx, false);
        let mut out = String::new();
        print_scratch_reg(&ctx, reg, "scratch", &mut out).unwrap();
        assert_eq!(
            out,
            format!("scratch = r3: not reserved, restore pending from {}", slot)
        );
    }

    #[test]
    fn test_slot_reuse_after_restore() {
        let tls = tls();
        let mut ilist = InstrList::new();
        let mut ctx = BuildContext::new();

        let cur = ilist.cursor();
        let a = reserve_register(&tls, &mut ilist, cur, allowed(&[1]), &mut ctx);
        let slot_a = ctx.slot_for(a).unwrap();
        let cur = ilist.cursor();
        unreserve_register(&tls, &mut ilist, cur, a, &mut ctx, true);

        let cur = ilist.cursor();
        let b = reserve_register(&tls, &mut ilist, cur, allowed(&[2]), &mut ctx);
        assert_eq!(ctx.slot_for(b), Some(slot_a));
    }
}
