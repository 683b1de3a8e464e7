//! TLS slot store: raw get/set of per-thread scratch values at fixed
//! small-integer indices, backed by a per-thread segment.
//!
//! No policy lives here; the reservation layer decides *which* slot
//! holds *what*. Slots are per-thread, so two threads building
//! fragments concurrently never contend on slot storage. The one
//! process-wide item, the choice of segment register, is fixed at
//! [`InstruTls::init`] and never mutated afterwards, so no
//! synchronization is needed post-initialization.

use crate::instr::MemArg;
use crate::{SegReg, TlsSlot, NUM_TLS_SLOTS, TLS_SLOT_BYTES};
use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One thread's TLS segment: a fixed array of word-sized slots.
///
/// Slot cells are relaxed atomics: the owning thread is the only
/// writer on the hot path, but the runtime may read another thread's
/// (suspended) segment through its `ThreadContext`, and atomics give
/// that without any locking.
pub struct TlsSegment {
    slots: [AtomicUsize; NUM_TLS_SLOTS],
}

impl TlsSegment {
    fn new() -> Self {
        TlsSegment {
            slots: Default::default(),
        }
    }

    #[inline(always)]
    fn get(&self, slot: TlsSlot) -> usize {
        self.slots[slot.index()].load(Ordering::Relaxed)
    }

    #[inline(always)]
    fn set(&self, slot: TlsSlot, val: usize) {
        self.slots[slot.index()].store(val, Ordering::Relaxed);
    }

    /// Base address of this segment, for address computation by the
    /// code generator.
    #[inline(always)]
    fn base(&self) -> usize {
        self.slots.as_ptr() as usize
    }
}

thread_local! {
    static OWN_SEGMENT: RefCell<Option<Arc<TlsSegment>>> = RefCell::new(None);
}

/// Process-wide TLS configuration, established exactly once at process
/// start and immutable thereafter: which segment register anchors the
/// per-thread segment, and whether whole-basic-block spilling is
/// enabled. Passed by reference into every component that needs it.
pub struct InstruTls {
    seg: SegReg,
    whole_bb_spills: bool,
}

impl InstruTls {
    /// Establish the process-wide TLS mechanism. Called exactly once
    /// per process by the external runtime, before any thread begins
    /// instrumenting.
    pub fn init(seg: SegReg, whole_bb_spills: bool) -> InstruTls {
        trace!(
            "instru_tls_init: seg = {}, whole_bb_spills = {}",
            seg,
            whole_bb_spills
        );
        InstruTls {
            seg,
            whole_bb_spills,
        }
    }

    /// Tear down the process-wide mechanism. Calling any other
    /// operation afterwards is undefined.
    pub fn exit(self) {
        trace!("instru_tls_exit");
    }

    /// The segment register serving as the TLS base.
    #[inline(always)]
    pub fn seg(&self) -> SegReg {
        self.seg
    }

    /// Whether one register is reserved across each whole basic block
    /// instead of per use site.
    #[inline(always)]
    pub fn whole_bb_spills_enabled(&self) -> bool {
        self.whole_bb_spills
    }

    /// The segment-relative memory operand naming `slot`; this is the
    /// operand emitted spill/restore instructions address.
    #[inline(always)]
    pub fn slot_opnd(&self, slot: TlsSlot) -> MemArg {
        MemArg {
            seg: self.seg,
            disp: slot.offset(),
        }
    }

    /// Allocate the calling thread's segment instance and register it
    /// for own-thread access. Called exactly once per thread by the
    /// external runtime.
    pub fn thread_init(&self) -> ThreadContext {
        let segment = Arc::new(TlsSegment::new());
        OWN_SEGMENT.with(|own| {
            let mut own = own.borrow_mut();
            debug_assert!(own.is_none(), "thread TLS initialized twice");
            *own = Some(segment.clone());
        });
        trace!("instru_tls_thread_init: base = {:#x}", segment.base());
        ThreadContext { segment }
    }

    /// Free the per-thread segment instance. The context must belong
    /// to the calling thread.
    pub fn thread_exit(&self, tc: ThreadContext) {
        OWN_SEGMENT.with(|own| {
            let mut own = own.borrow_mut();
            debug_assert!(
                own.as_ref()
                    .map_or(false, |seg| Arc::ptr_eq(seg, &tc.segment)),
                "thread TLS exit from the wrong thread"
            );
            *own = None;
        });
        trace!("instru_tls_thread_exit");
    }
}

/// Handle to one thread's TLS segment, owned by the external runtime
/// for the thread's lifetime.
pub struct ThreadContext {
    segment: Arc<TlsSegment>,
}

impl ThreadContext {
    /// Read a slot by logical index.
    #[inline(always)]
    pub fn get_slot(&self, slot: TlsSlot) -> usize {
        self.segment.get(slot)
    }

    /// Write a slot by logical index.
    #[inline(always)]
    pub fn set_slot(&self, slot: TlsSlot, val: usize) {
        self.segment.set(slot, val);
    }

    /// Base address of this thread's segment.
    #[inline(always)]
    pub fn seg_base(&self) -> usize {
        self.segment.base()
    }
}

fn with_own_segment<R>(f: impl FnOnce(&TlsSegment) -> R) -> R {
    OWN_SEGMENT.with(|own| {
        let own = own.borrow();
        let seg = own
            .as_ref()
            .expect("thread TLS accessed before instru_tls_thread_init");
        f(seg)
    })
}

/// Read a slot in the calling thread's own segment, without
/// re-resolving thread identity.
#[inline]
pub fn get_own_tls_value(slot: TlsSlot) -> usize {
    with_own_segment(|seg| seg.get(slot))
}

/// Write a slot in the calling thread's own segment.
#[inline]
pub fn set_own_tls_value(slot: TlsSlot, val: usize) {
    with_own_segment(|seg| seg.set(slot, val));
}

/// Read a slot in the calling thread's own segment by byte offset
/// rather than logical index. An unaligned or out-of-range offset is a
/// caller error, guarded only by debug assertions.
#[inline]
pub fn get_raw_tls_value(offset: u32) -> usize {
    debug_assert!(offset as usize % TLS_SLOT_BYTES == 0);
    let slot = TlsSlot::new(offset as usize / TLS_SLOT_BYTES);
    with_own_segment(|seg| seg.get(slot))
}

/// Base address of the calling thread's own segment.
#[inline]
pub fn get_own_seg_base() -> usize {
    with_own_segment(|seg| seg.base())
}
