//! Scratch-register and TLS spill-slot management for inserted
//! instrumentation code.
//!
//! When an instrumentation engine rewrites application code to insert
//! analysis instructions, those instructions need temporary registers
//! without corrupting application register state or condition flags.
//! This crate decides which physical registers and which thread-local
//! storage (TLS) slots hold displaced values, tracks what is currently
//! borrowed, and guarantees every borrow is undone before control
//! returns to application code. A whole-basic-block mode shares one
//! reserved register across all use sites in a block so that repeated
//! checks amortize a single spill/restore pair and the block keeps one
//! register-allocation shape for fault translation.

#![allow(dead_code)]

macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(feature = "trace-log") {
            ::log::trace!($($tt)*);
        }
    };
}

#[macro_use]
mod index;
pub use index::{Inst, InstRange, InstRangeIter};

pub mod checker;
pub mod instr;
pub mod reserve;
pub mod shared;
pub mod tls;

/// A general-purpose physical register, identified by its hardware
/// encoding.
///
/// Because of bit-packed encodings throughout the implementation,
/// `hw_enc` must fit in 5 bits, i.e., at most 32 registers. The flags
/// register is not a `Reg`: flags reservation is a separate operation
/// (`reserve::reserve_aflags`) because there is no register choice to
/// make for it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct Reg {
    hw_enc: u8,
}

impl Reg {
    pub const MAX_BITS: usize = 5;
    pub const MAX: usize = (1 << Self::MAX_BITS) - 1;

    /// Create a new Reg. The `hw_enc` range is 5 bits.
    #[inline(always)]
    pub const fn new(hw_enc: usize) -> Self {
        // Emulate a const assert until const panics are available on
        // our minimum toolchain.
        const HW_ENC_MUST_BE_IN_BOUNDS: &[bool; Reg::MAX + 1] = &[true; Reg::MAX + 1];
        let _ = HW_ENC_MUST_BE_IN_BOUNDS[hw_enc];

        Reg {
            hw_enc: hw_enc as u8,
        }
    }

    /// The hardware register number, as encoded by the ISA.
    #[inline(always)]
    pub fn hw_enc(self) -> usize {
        self.hw_enc as usize
    }

    /// An index into a dense space of all registers, for keeping
    /// per-register side tables.
    #[inline(always)]
    pub fn index(self) -> usize {
        self.hw_enc as usize
    }

    #[inline(always)]
    pub fn from_index(index: usize) -> Self {
        Reg::new(index & Self::MAX)
    }

    #[inline(always)]
    pub fn invalid() -> Self {
        Reg::new(Self::MAX)
    }

    #[inline(always)]
    pub fn is_valid(self) -> bool {
        self != Self::invalid()
    }
}

impl std::fmt::Debug for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Reg(hw = {})", self.hw_enc())
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "r{}", self.hw_enc())
    }
}

/// A set of `Reg`s, stored as a bitmask.
///
/// Used both for caller-supplied allowed sets and for the build
/// context's currently-reserved set.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct RegSet {
    bits: u32,
}

impl RegSet {
    #[inline(always)]
    pub const fn empty() -> Self {
        RegSet { bits: 0 }
    }

    /// Returns a copy of this set with `reg` added; const-friendly so
    /// allowed sets can be built as constants.
    #[inline(always)]
    pub const fn with(self, reg: Reg) -> Self {
        RegSet {
            bits: self.bits | (1 << reg.hw_enc),
        }
    }

    #[inline(always)]
    pub fn contains(self, reg: Reg) -> bool {
        self.bits & (1 << reg.hw_enc()) != 0
    }

    #[inline(always)]
    pub fn insert(&mut self, reg: Reg) {
        self.bits |= 1 << reg.hw_enc();
    }

    #[inline(always)]
    pub fn remove(&mut self, reg: Reg) {
        self.bits &= !(1 << reg.hw_enc());
    }

    #[inline(always)]
    pub fn is_empty(self) -> bool {
        self.bits == 0
    }

    #[inline(always)]
    pub fn len(self) -> usize {
        self.bits.count_ones() as usize
    }

    /// The lowest-numbered register in the set, if any. Reservation
    /// picks the first eligible register deterministically so fragment
    /// shapes are reproducible.
    #[inline(always)]
    pub fn first(self) -> Option<Reg> {
        if self.bits == 0 {
            None
        } else {
            Some(Reg::new(self.bits.trailing_zeros() as usize))
        }
    }

    #[inline(always)]
    pub fn iter(self) -> RegSetIter {
        RegSetIter { bits: self.bits }
    }
}

impl std::ops::BitAnd for RegSet {
    type Output = RegSet;
    #[inline(always)]
    fn bitand(self, rhs: RegSet) -> RegSet {
        RegSet {
            bits: self.bits & rhs.bits,
        }
    }
}

impl std::ops::BitOr for RegSet {
    type Output = RegSet;
    #[inline(always)]
    fn bitor(self, rhs: RegSet) -> RegSet {
        RegSet {
            bits: self.bits | rhs.bits,
        }
    }
}

impl std::ops::Not for RegSet {
    type Output = RegSet;
    #[inline(always)]
    fn not(self) -> RegSet {
        RegSet { bits: !self.bits }
    }
}

impl std::iter::FromIterator<Reg> for RegSet {
    fn from_iter<I: IntoIterator<Item = Reg>>(iter: I) -> Self {
        let mut set = RegSet::empty();
        for reg in iter {
            set.insert(reg);
        }
        set
    }
}

#[derive(Clone, Copy)]
pub struct RegSetIter {
    bits: u32,
}

impl Iterator for RegSetIter {
    type Item = Reg;
    #[inline(always)]
    fn next(&mut self) -> Option<Reg> {
        if self.bits == 0 {
            None
        } else {
            let hw = self.bits.trailing_zeros() as usize;
            self.bits &= self.bits - 1;
            Some(Reg::new(hw))
        }
    }
}

impl IntoIterator for RegSet {
    type Item = Reg;
    type IntoIter = RegSetIter;
    #[inline(always)]
    fn into_iter(self) -> RegSetIter {
        self.iter()
    }
}

impl std::fmt::Debug for RegSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "RegSet{{")?;
        let mut first = true;
        for reg in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}", reg)?;
            first = false;
        }
        write!(f, "}}")
    }
}

/// The hardware segment register that anchors the per-thread TLS
/// segment. Chosen once at [`tls::InstruTls::init`] and immutable
/// thereafter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum SegReg {
    Fs,
    Gs,
}

impl std::fmt::Display for SegReg {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SegReg::Fs => write!(f, "fs"),
            SegReg::Gs => write!(f, "gs"),
        }
    }
}

/// Number of word-sized slots in each thread's TLS segment.
pub const NUM_TLS_SLOTS: usize = 8;

/// Size in bytes of one TLS slot.
pub const TLS_SLOT_BYTES: usize = std::mem::size_of::<usize>();

/// An addressable storage cell in the per-thread TLS segment,
/// identified by a small index. Byte offset into the segment is
/// `index * TLS_SLOT_BYTES`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct TlsSlot(u8);

/// Slot carrying the parameter to out-of-line slowpath analysis code.
pub const SLOT_SLOW_PARAM: TlsSlot = TlsSlot(0);

/// Slot carrying the slowpath's result back to inline code.
pub const SLOT_SLOW_RET: TlsSlot = TlsSlot(1);

/// First slot available for register preservation. The slowpath
/// communication slots below this index are never handed out for
/// spills, so the two concerns stay independent within one
/// instrumentation sequence.
pub const FIRST_SPILL_SLOT: usize = 2;

impl TlsSlot {
    #[inline(always)]
    pub fn new(index: usize) -> Self {
        debug_assert!(index < NUM_TLS_SLOTS);
        TlsSlot(index as u8)
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Byte offset of this slot within the TLS segment.
    #[inline(always)]
    pub fn offset(self) -> u32 {
        (self.0 as usize * TLS_SLOT_BYTES) as u32
    }

    /// Recover a slot from a byte offset, if the offset names one.
    #[inline(always)]
    pub fn from_offset(offset: u32) -> Option<TlsSlot> {
        let offset = offset as usize;
        if offset % TLS_SLOT_BYTES != 0 {
            return None;
        }
        let index = offset / TLS_SLOT_BYTES;
        if index < NUM_TLS_SLOTS {
            Some(TlsSlot(index as u8))
        } else {
            None
        }
    }

    /// Whether this slot belongs to the register-preservation range,
    /// as opposed to the slowpath communication range.
    #[inline(always)]
    pub fn is_spill_slot(self) -> bool {
        self.index() >= FIRST_SPILL_SLOT
    }
}

impl std::fmt::Debug for TlsSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::fmt::Display for TlsSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "tls{}", self.index())
    }
}

/// A failure from the reservation layer.
///
/// No variant is recoverable: every one represents either a defect in
/// the instrumentation engine's use of the protocol or a fragment
/// whose register pressure exceeds its design. The public reservation
/// entry points convert these into fatal panics through
/// `assert_reserved`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReserveError {
    /// No unreserved register remains in the caller's allowed set.
    Exhausted { allowed: RegSet },
    /// Unreserve of a register that is not currently reserved.
    NotReserved(Reg),
    /// Reserve of a register that is already reserved.
    AlreadyReserved(Reg),
    /// No free TLS preservation slot remains for a spill.
    NoFreeSlot,
    /// Flags reserved while already reserved.
    AflagsAlreadyReserved,
    /// Flags unreserved without a matching reserve.
    AflagsNotReserved,
    /// A per-site operation touched the block's live shared register.
    SharedHeld(Reg),
    /// Shared unreserve with no shared reservation in the block.
    SharedNotHeld,
    /// Shared reservation requested while whole-bb spilling is off.
    SharedDisabled,
}

impl std::fmt::Display for ReserveError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ReserveError::Exhausted { allowed } => {
                write!(f, "no unreserved register available in {:?}", allowed)
            }
            ReserveError::NotReserved(reg) => {
                write!(f, "unreserve of {} which is not reserved", reg)
            }
            ReserveError::AlreadyReserved(reg) => {
                write!(f, "reserve of {} which is already reserved", reg)
            }
            ReserveError::NoFreeSlot => write!(f, "no free TLS preservation slot"),
            ReserveError::AflagsAlreadyReserved => {
                write!(f, "aflags reserved while already reserved")
            }
            ReserveError::AflagsNotReserved => {
                write!(f, "aflags unreserved without matching reserve")
            }
            ReserveError::SharedHeld(reg) => write!(
                f,
                "operation on {} while it is the live shared register",
                reg
            ),
            ReserveError::SharedNotHeld => {
                write!(f, "shared unreserve with no shared reservation held")
            }
            ReserveError::SharedDisabled => write!(
                f,
                "shared reservation requested with whole-bb spilling disabled"
            ),
        }
    }
}

impl std::error::Error for ReserveError {}

/// Centralized "assert on failure" conversion: the reservation layer
/// reports failures as `ReserveError`, and every public entry point
/// escalates them here. A failure is a tool-development-time bug, not
/// an environmental condition; continuing would risk silently
/// corrupting the application's register state.
#[inline]
pub(crate) fn assert_reserved<T>(result: Result<T, ReserveError>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("scratch register protocol violation: {}", e),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_regset_ops() {
        let a = RegSet::empty().with(Reg::new(1)).with(Reg::new(3));
        let b = RegSet::empty().with(Reg::new(3)).with(Reg::new(5));
        assert!(a.contains(Reg::new(1)));
        assert!(!a.contains(Reg::new(5)));
        assert_eq!((a & b).iter().collect::<Vec<_>>(), vec![Reg::new(3)]);
        assert_eq!((a | b).len(), 3);
        assert_eq!((a & !b).iter().collect::<Vec<_>>(), vec![Reg::new(1)]);
        assert_eq!(a.first(), Some(Reg::new(1)));
        assert_eq!(RegSet::empty().first(), None);
    }

    #[test]
    fn test_slot_offsets() {
        for i in 0..NUM_TLS_SLOTS {
            let slot = TlsSlot::new(i);
            assert_eq!(TlsSlot::from_offset(slot.offset()), Some(slot));
        }
        assert_eq!(TlsSlot::from_offset(3), None);
        assert_eq!(
            TlsSlot::from_offset((NUM_TLS_SLOTS * TLS_SLOT_BYTES) as u32),
            None
        );
        assert!(!SLOT_SLOW_PARAM.is_spill_slot());
        assert!(!SLOT_SLOW_RET.is_spill_slot());
        assert!(TlsSlot::new(FIRST_SPILL_SLOT).is_spill_slot());
    }
}
