//! Shadow memory: per-granule access history.
//!
//! Every 8-byte granule of the application window owns one 72-byte
//! [`ShadowCell`] at `shadow_beg + (granule - app_beg) * 9`. A cell holds a
//! lock/cursor header, a ring of [`SHADOW_DEPTH`] packed [`AccessRecord`]s, and
//! the pc of each recorded access in a parallel slot.
//!
//! The region is reserved once, never resized, and sits between two
//! inaccessible guard ranges. Fresh shadow reads as zero, and an all-zero
//! record is empty because valid epochs start at 1.

#![allow(unsafe_code)]

use std::fmt;
use std::hint;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use crate::error::PlatformError;
use crate::platform::{self, PAGE_SIZE};
use crate::vector_clock::{EPOCH_BITS, Epoch, MAX_EPOCH, Tid, VectorClock};

/// Bytes of application memory per shadow cell.
pub const GRANULE: usize = 8;
/// Access records kept per cell.
pub const SHADOW_DEPTH: usize = 4;
/// Size of one [`ShadowCell`].
pub const CELL_SIZE: usize = 72;
/// Shadow bytes per application byte.
pub const SHADOW_MULTIPLIER: usize = CELL_SIZE / GRANULE;

/// Guard size on each side of the fixed shadow.
pub const GUARD_SIZE: usize = 1 << 40;

pub const FIXED_APP_BEG: usize = 0x7e00_0000_0000;
pub const FIXED_APP_END: usize = 0x8000_0000_0000;
pub const FIXED_SHADOW_BEG: usize = 0x1000_0000_0000;
pub const FIXED_SHADOW_END: usize = 0x2200_0000_0000;

// Record word: tid 0..=15, epoch 16..=55, is_write 56, offset 57..=59,
// size-1 60..=62.
const TID_MASK: u64 = 0xffff;
const EPOCH_SHIFT: u32 = 16;
const WRITE_SHIFT: u32 = EPOCH_SHIFT + EPOCH_BITS;
const OFFSET_SHIFT: u32 = WRITE_SHIFT + 1;
const SIZE_SHIFT: u32 = OFFSET_SHIFT + 3;
const FIELD3_MASK: u64 = 0b111;

/// One recorded access to a granule, packed into a single word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessRecord(u64);

impl AccessRecord {
    pub const EMPTY: Self = Self(0);

    /// `offset` and `size` describe the touched bytes within the granule.
    #[must_use]
    pub fn new(tid: Tid, epoch: Epoch, offset: usize, size: usize, is_write: bool) -> Self {
        crate::racesan_check!(epoch != 0 && epoch <= MAX_EPOCH);
        crate::racesan_check!(size >= 1 && offset + size <= GRANULE);
        Self(
            u64::from(tid)
                | (epoch << EPOCH_SHIFT)
                | (u64::from(is_write) << WRITE_SHIFT)
                | ((offset as u64) << OFFSET_SHIFT)
                | (((size - 1) as u64) << SIZE_SHIFT),
        )
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn tid(self) -> Tid {
        (self.0 & TID_MASK) as Tid
    }

    #[inline]
    #[must_use]
    pub const fn epoch(self) -> Epoch {
        (self.0 >> EPOCH_SHIFT) & MAX_EPOCH
    }

    #[inline]
    #[must_use]
    pub const fn is_write(self) -> bool {
        (self.0 >> WRITE_SHIFT) & 1 != 0
    }

    #[inline]
    #[must_use]
    pub const fn offset(self) -> usize {
        ((self.0 >> OFFSET_SHIFT) & FIELD3_MASK) as usize
    }

    #[inline]
    #[must_use]
    pub const fn size(self) -> usize {
        ((self.0 >> SIZE_SHIFT) & FIELD3_MASK) as usize + 1
    }

    #[inline]
    #[must_use]
    pub fn overlaps(self, other: AccessRecord) -> bool {
        self.offset() < other.offset() + other.size() && other.offset() < self.offset() + self.size()
    }

    #[inline]
    #[must_use]
    pub fn same_range(self, other: AccessRecord) -> bool {
        self.offset() == other.offset() && self.size() == other.size()
    }

    /// True when this recorded access and `cur` touch common bytes, at least
    /// one of them writes, and the owner of `clock` has not observed this
    /// record's epoch.
    #[inline]
    #[must_use]
    pub fn races_with(self, cur: AccessRecord, clock: &VectorClock) -> bool {
        !self.is_empty()
            && (self.is_write() || cur.is_write())
            && self.overlaps(cur)
            && self.epoch() > clock.get(self.tid())
    }
}

impl fmt::Debug for AccessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("AccessRecord(empty)");
        }
        write!(
            f,
            "AccessRecord(T{} @{} {} [{}, +{}))",
            self.tid(),
            self.epoch(),
            if self.is_write() { "W" } else { "R" },
            self.offset(),
            self.size()
        )
    }
}

const CELL_LOCKED: u64 = 1;
const CURSOR_SHIFT: u32 = 1;
const CURSOR_MASK: u64 = 0b111;

/// Access history of one granule.
#[repr(C)]
pub struct ShadowCell {
    header: AtomicU64,
    records: [AtomicU64; SHADOW_DEPTH],
    pcs: [AtomicUsize; SHADOW_DEPTH],
}

const _: () = assert!(std::mem::size_of::<ShadowCell>() == CELL_SIZE);

impl ShadowCell {
    /// Spin until the cell lock is ours. `backoff` is called with the number
    /// of failed attempts so far.
    #[inline]
    pub fn lock(&self, mut backoff: impl FnMut(u32)) -> CellGuard<'_> {
        let mut failures = 0u32;
        loop {
            let cur = self.header.load(Ordering::Relaxed);
            if cur & CELL_LOCKED == 0
                && self
                    .header
                    .compare_exchange_weak(cur, cur | CELL_LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return CellGuard {
                    cell: self,
                    cursor: ((cur >> CURSOR_SHIFT) & CURSOR_MASK) as usize,
                };
            }
            failures = failures.saturating_add(1);
            backoff(failures);
        }
    }

    /// Lock without backoff; for tests and diagnostics.
    pub fn lock_spinning(&self) -> CellGuard<'_> {
        self.lock(|_| hint::spin_loop())
    }
}

/// Exclusive access to a locked cell. Unlocks on drop.
pub struct CellGuard<'a> {
    cell: &'a ShadowCell,
    cursor: usize,
}

impl CellGuard<'_> {
    #[inline]
    #[must_use]
    pub fn record(&self, slot: usize) -> AccessRecord {
        AccessRecord(self.cell.records[slot].load(Ordering::Relaxed))
    }

    #[inline]
    #[must_use]
    pub fn pc(&self, slot: usize) -> usize {
        self.cell.pcs[slot].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store(&mut self, slot: usize, rec: AccessRecord, pc: usize) {
        self.cell.records[slot].store(rec.0, Ordering::Relaxed);
        self.cell.pcs[slot].store(pc, Ordering::Relaxed);
    }

    /// Store at the ring cursor, evicting the oldest record. Returns the slot.
    #[inline]
    pub fn push(&mut self, rec: AccessRecord, pc: usize) -> usize {
        let slot = self.cursor;
        self.store(slot, rec, pc);
        self.cursor = (slot + 1) % SHADOW_DEPTH;
        slot
    }

    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

impl Drop for CellGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.cell
            .header
            .store((self.cursor as u64) << CURSOR_SHIFT, Ordering::Release);
    }
}

/// Address map between the application window and its shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShadowLayout {
    pub app_beg: usize,
    pub app_end: usize,
    pub shadow_beg: usize,
    pub shadow_end: usize,
    pub guard_size: usize,
}

impl ShadowLayout {
    /// Default x86_64 Linux layout.
    #[must_use]
    pub const fn fixed() -> Self {
        Self {
            app_beg: FIXED_APP_BEG,
            app_end: FIXED_APP_END,
            shadow_beg: FIXED_SHADOW_BEG,
            shadow_end: FIXED_SHADOW_END,
            guard_size: GUARD_SIZE,
        }
    }

    /// Bytes of shadow needed for `[app_beg, app_end)`.
    pub fn shadow_size_for(app_beg: usize, app_end: usize) -> Result<usize, PlatformError> {
        if app_beg % PAGE_SIZE != 0 || app_end % PAGE_SIZE != 0 {
            return Err(PlatformError::BadLayout("application range is not page aligned"));
        }
        if app_end <= app_beg {
            return Err(PlatformError::BadLayout("application range is empty"));
        }
        (app_end - app_beg)
            .checked_mul(SHADOW_MULTIPLIER)
            .ok_or(PlatformError::BadLayout("shadow size overflows"))
    }

    /// Layout for `[app_beg, app_end)` with its shadow starting at
    /// `shadow_beg` and `guard_size` bytes of guard on each side.
    pub fn new(
        app_beg: usize,
        app_end: usize,
        shadow_beg: usize,
        guard_size: usize,
    ) -> Result<Self, PlatformError> {
        let size = Self::shadow_size_for(app_beg, app_end)?;
        if shadow_beg % PAGE_SIZE != 0 || guard_size % PAGE_SIZE != 0 {
            return Err(PlatformError::BadLayout("shadow range is not page aligned"));
        }
        let shadow_end = shadow_beg
            .checked_add(size)
            .ok_or(PlatformError::BadLayout("shadow range overflows"))?;
        if shadow_beg < guard_size || shadow_end.checked_add(guard_size).is_none() {
            return Err(PlatformError::BadLayout("guard range overflows"));
        }
        let layout = Self {
            app_beg,
            app_end,
            shadow_beg,
            shadow_end,
            guard_size,
        };
        let (lo, hi) = (layout.guard_lo().0, layout.guard_hi().1);
        if lo < app_end && app_beg < hi {
            return Err(PlatformError::BadLayout("shadow overlaps the application range"));
        }
        Ok(layout)
    }

    #[must_use]
    pub const fn shadow_size(&self) -> usize {
        self.shadow_end - self.shadow_beg
    }

    #[must_use]
    pub const fn guard_lo(&self) -> (usize, usize) {
        (self.shadow_beg - self.guard_size, self.shadow_beg)
    }

    #[must_use]
    pub const fn guard_hi(&self) -> (usize, usize) {
        (self.shadow_end, self.shadow_end + self.guard_size)
    }

    /// Guard, shadow and guard, in address order.
    #[must_use]
    pub const fn reserved_ranges(&self) -> [(usize, usize); 3] {
        [
            self.guard_lo(),
            (self.shadow_beg, self.shadow_end),
            self.guard_hi(),
        ]
    }

    #[inline]
    #[must_use]
    pub const fn contains_app(&self, addr: usize) -> bool {
        addr >= self.app_beg && addr < self.app_end
    }

    /// Address of the cell for the granule holding `addr`.
    #[inline]
    #[must_use]
    pub const fn mem_to_shadow(&self, addr: usize) -> usize {
        self.shadow_beg + ((addr & !(GRANULE - 1)) - self.app_beg) * SHADOW_MULTIPLIER
    }

    /// First application address of the granule whose cell is at `shadow`.
    #[must_use]
    pub const fn shadow_to_mem(&self, shadow: usize) -> usize {
        self.app_beg + (shadow - self.shadow_beg) / SHADOW_MULTIPLIER
    }
}

/// Guard size used when the kernel picks the shadow base: as large as the
/// shadow itself, up to [`GUARD_SIZE`].
#[must_use]
pub fn relocatable_guard_size(shadow_size: usize) -> usize {
    platform::round_up_to_page(shadow_size).min(GUARD_SIZE)
}

/// The reserved shadow region. Released on drop.
pub struct ShadowRegion {
    layout: ShadowLayout,
}

impl ShadowRegion {
    /// Reserve `layout` at its fixed addresses.
    pub fn reserve_fixed(layout: ShadowLayout) -> Result<Self, PlatformError> {
        let (lo_beg, lo_end) = layout.guard_lo();
        let (hi_beg, hi_end) = layout.guard_hi();
        platform::protect_range(lo_beg, lo_end)?;
        platform::reserve_fixed(layout.shadow_beg, layout.shadow_size())?;
        platform::protect_range(hi_beg, hi_end)?;
        crate::dprintf!(
            "racesan: shadow [{:#x}, {:#x}) guards {:#x}",
            layout.shadow_beg,
            layout.shadow_end,
            layout.guard_size
        );
        Ok(Self { layout })
    }

    /// Reserve shadow for `[app_beg, app_end)` wherever the kernel has room.
    pub fn reserve_relocatable(app_beg: usize, app_end: usize) -> Result<Self, PlatformError> {
        let size = ShadowLayout::shadow_size_for(app_beg, app_end)?;
        let guard = relocatable_guard_size(size);
        let total = size
            .checked_add(2 * guard)
            .ok_or(PlatformError::BadLayout("shadow reservation overflows"))?;
        let base = platform::reserve_inaccessible(total)?;
        let layout = match ShadowLayout::new(app_beg, app_end, base + guard, guard) {
            Ok(layout) => layout,
            Err(e) => {
                let _ = platform::release(base, total);
                return Err(e);
            }
        };
        if let Err(e) = platform::make_accessible(layout.shadow_beg, layout.shadow_end) {
            let _ = platform::release(base, total);
            return Err(e);
        }
        crate::dprintf!(
            "racesan: relocatable shadow [{:#x}, {:#x}) for app [{:#x}, {:#x})",
            layout.shadow_beg,
            layout.shadow_end,
            app_beg,
            app_end
        );
        Ok(Self { layout })
    }

    #[inline]
    #[must_use]
    pub fn layout(&self) -> &ShadowLayout {
        &self.layout
    }

    /// Cell for the granule holding `addr`. `addr` must be inside the
    /// application window.
    #[inline]
    #[must_use]
    pub fn cell(&self, addr: usize) -> &ShadowCell {
        crate::racesan_check!(self.layout.contains_app(addr));
        let shadow = self.layout.mem_to_shadow(addr);
        // SAFETY: `addr` is in the application window, so `shadow` lies in the
        // read/write shadow this region reserved and keeps mapped for its own
        // lifetime. Cells are 8-byte aligned (page-aligned base, 72-byte
        // stride) and zeroed memory is a valid cell.
        unsafe { &*(shadow as *const ShadowCell) }
    }
}

impl Drop for ShadowRegion {
    fn drop(&mut self) {
        let (beg, _) = self.layout.guard_lo();
        let (_, end) = self.layout.guard_hi();
        if let Err(e) = platform::release(beg, end - beg) {
            crate::error::warn(e);
        }
    }
}

impl fmt::Debug for ShadowRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowRegion")
            .field("layout", &self.layout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP: usize = 0x7e00_0000_0000;

    #[test]
    fn record_fields_roundtrip() {
        let rec = AccessRecord::new(0xbeef, MAX_EPOCH, 5, 3, true);
        assert_eq!(rec.tid(), 0xbeef);
        assert_eq!(rec.epoch(), MAX_EPOCH);
        assert!(rec.is_write());
        assert_eq!(rec.offset(), 5);
        assert_eq!(rec.size(), 3);
        assert_eq!(rec.raw() >> 63, 0);

        let read = AccessRecord::new(0, 1, 0, 8, false);
        assert!(!read.is_write());
        assert_eq!(read.size(), 8);
        assert!(!read.is_empty());
        assert!(AccessRecord::EMPTY.is_empty());
    }

    #[test]
    fn overlap_is_byte_exact() {
        let low = AccessRecord::new(0, 1, 0, 4, true);
        let high = AccessRecord::new(1, 1, 4, 4, true);
        let mid = AccessRecord::new(1, 1, 3, 2, false);
        assert!(!low.overlaps(high));
        assert!(low.overlaps(mid));
        assert!(high.overlaps(mid));
    }

    #[test]
    fn race_needs_a_write_and_an_unobserved_epoch() {
        let mut clock = VectorClock::new();
        clock.set(1, 1);
        let prev_write = AccessRecord::new(0, 3, 0, 8, true);
        let prev_read = AccessRecord::new(0, 3, 0, 8, false);
        let cur_read = AccessRecord::new(1, 1, 0, 8, false);
        assert!(prev_write.races_with(cur_read, &clock));
        assert!(!prev_read.races_with(cur_read, &clock));

        clock.set(0, 3);
        assert!(!prev_write.races_with(cur_read, &clock));
        assert!(!AccessRecord::EMPTY.races_with(cur_read, &clock));
    }

    #[test]
    fn fixed_layout_transform() {
        let l = ShadowLayout::fixed();
        assert_eq!(l.shadow_size(), (FIXED_APP_END - FIXED_APP_BEG) * 9);
        assert_eq!(l.mem_to_shadow(FIXED_APP_BEG), FIXED_SHADOW_BEG);
        assert_eq!(l.mem_to_shadow(FIXED_APP_BEG + 7), FIXED_SHADOW_BEG);
        assert_eq!(l.mem_to_shadow(FIXED_APP_BEG + 8), FIXED_SHADOW_BEG + CELL_SIZE);
        assert_eq!(l.mem_to_shadow(FIXED_APP_END - 1), FIXED_SHADOW_END - CELL_SIZE);
        assert_eq!(l.guard_lo(), (0x0f00_0000_0000, 0x1000_0000_0000));
        assert_eq!(l.guard_hi(), (0x2200_0000_0000, 0x2300_0000_0000));
        assert_eq!(l.shadow_to_mem(l.mem_to_shadow(APP + 0x1238)), APP + 0x1238);
        assert_eq!(
            ShadowLayout::new(FIXED_APP_BEG, FIXED_APP_END, FIXED_SHADOW_BEG, GUARD_SIZE).unwrap(),
            l
        );
    }

    #[test]
    fn malformed_layouts_are_rejected() {
        assert!(ShadowLayout::new(APP + 1, APP + PAGE_SIZE, 0x1000_0000_0000, PAGE_SIZE).is_err());
        assert!(ShadowLayout::new(APP, APP, 0x1000_0000_0000, PAGE_SIZE).is_err());
        assert!(ShadowLayout::new(APP, APP + PAGE_SIZE, 0, PAGE_SIZE).is_err());
        // Shadow on top of the application window.
        assert!(ShadowLayout::new(APP, APP + PAGE_SIZE, APP, PAGE_SIZE).is_err());
    }

    #[test]
    fn relocatable_region_cells_start_empty_and_keep_history() {
        let region = ShadowRegion::reserve_relocatable(APP, APP + 16 * PAGE_SIZE).unwrap();
        let layout = *region.layout();
        assert_eq!(layout.guard_size, relocatable_guard_size(layout.shadow_size()));
        assert!(layout.contains_app(APP + 100));
        assert!(!layout.contains_app(APP + 16 * PAGE_SIZE));

        let cell = region.cell(APP + 64);
        {
            let g = cell.lock_spinning();
            for slot in 0..SHADOW_DEPTH {
                assert!(g.record(slot).is_empty());
                assert_eq!(g.pc(slot), 0);
            }
        }
        let rec = AccessRecord::new(2, 9, 0, 8, true);
        {
            let mut g = cell.lock_spinning();
            assert_eq!(g.push(rec, 0x4000), 0);
        }
        let g = cell.lock_spinning();
        assert_eq!(g.cursor(), 1);
        assert_eq!(g.record(0), rec);
        assert_eq!(g.pc(0), 0x4000);
    }

    #[test]
    fn ring_evicts_oldest_first() {
        let region = ShadowRegion::reserve_relocatable(APP, APP + PAGE_SIZE).unwrap();
        let cell = region.cell(APP);
        for epoch in 1..=(SHADOW_DEPTH as Epoch + 1) {
            let mut g = cell.lock_spinning();
            g.push(AccessRecord::new(0, epoch, 0, 8, false), epoch as usize);
        }
        let g = cell.lock_spinning();
        let mut epochs: Vec<_> = (0..SHADOW_DEPTH).map(|s| g.record(s).epoch()).collect();
        epochs.sort_unstable();
        assert_eq!(epochs, vec![2, 3, 4, 5]);
    }

    #[test]
    fn cell_lock_excludes_other_threads() {
        use std::sync::Arc;
        let region = Arc::new(ShadowRegion::reserve_relocatable(APP, APP + PAGE_SIZE).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let region = Arc::clone(&region);
                std::thread::spawn(move || {
                    for _ in 0..5_000 {
                        let mut g = region.cell(APP + 8).lock_spinning();
                        let n = g.pc(0);
                        g.store(0, AccessRecord::EMPTY, n + 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(region.cell(APP + 8).lock_spinning().pc(0), 20_000);
    }
}
