//! Collector facade: allocation entry points, mark and sweep.

use std::ptr::NonNull;
use std::time::Instant;

use crate::config::GcConfig;
use crate::error::{GcError, GcResult};
use crate::raw;
use crate::record::Finalizer;
use crate::stack::{self, StackBase, WORD};
use crate::stats::GcStats;
use crate::table::AllocationTable;

/// Collection phase. `Idle` between runs; a run moves through `Marking`
/// then `Sweeping` and back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// No collection in progress.
    Idle,
    /// Tracing reachability from roots and the stack.
    Marking,
    /// Reclaiming unmarked regions.
    Sweeping,
}

/// A conservative mark-and-sweep garbage collector.
///
/// User code allocates through the collector instead of the system
/// allocator. Every live region is tracked in an internally-owned table
/// keyed by its address; a collection marks everything reachable from
/// ROOT-tagged records and (conservatively) from the mutator stack, then
/// sweeps the rest.
///
/// Collectors are plain values; several can coexist, each with its own
/// stack-base sentinel. All collection work runs inline on the calling
/// thread, either from an explicit [`run`](Self::run) or transparently
/// from an allocation entry point.
///
/// Finalisers must not allocate through, free through, or otherwise
/// re-enter the collector they run under.
pub struct Collector {
    table: AllocationTable,
    stack_base: StackBase,
    scan_stack: bool,
    paused: bool,
    phase: GcPhase,
    stats: GcStats,
}

impl Collector {
    /// Create a collector with default tuning. The sentinel must come
    /// from a frame the mutator never returns past while the collector is
    /// in use; every later collection has to be initiated from a frame
    /// deeper than it.
    pub fn new(stack_base: StackBase) -> Self {
        Self::with_config(stack_base, GcConfig::default())
    }

    /// Create a collector with explicit tuning. Out-of-range values fall
    /// back to defaults (see [`GcConfig`]).
    pub fn with_config(stack_base: StackBase, config: GcConfig) -> Self {
        let config = config.sanitized();
        let table = AllocationTable::new(
            config.min_capacity,
            config.initial_capacity,
            config.sweep_factor,
            config.downsize_factor,
            config.upsize_factor,
        );
        Self {
            table,
            stack_base,
            scan_stack: config.scan_stack,
            paused: false,
            phase: GcPhase::Idle,
            stats: GcStats::default(),
        }
    }

    // -----------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------

    /// Allocate `size` uninitialised bytes.
    pub fn alloc(&mut self, size: usize) -> GcResult<NonNull<u8>> {
        self.allocate(0, size, None)
    }

    /// Allocate `size` uninitialised bytes with a finaliser.
    pub fn alloc_with_finalizer(
        &mut self,
        size: usize,
        finalizer: Finalizer,
    ) -> GcResult<NonNull<u8>> {
        self.allocate(0, size, Some(finalizer))
    }

    /// Allocate `count * size` zeroed bytes.
    pub fn alloc_zeroed(&mut self, count: usize, size: usize) -> GcResult<NonNull<u8>> {
        self.allocate(count, size, None)
    }

    /// Allocate `count * size` zeroed bytes with a finaliser.
    pub fn alloc_zeroed_with_finalizer(
        &mut self,
        count: usize,
        size: usize,
        finalizer: Finalizer,
    ) -> GcResult<NonNull<u8>> {
        self.allocate(count, size, Some(finalizer))
    }

    /// Generalised allocation: `count == 0` yields `size` uninitialised
    /// bytes, anything else `count * size` zeroed bytes.
    ///
    /// A raw allocation failure triggers one collection and one retry.
    /// The same applies to a metadata recording failure; if that retry
    /// also fails the region is released and the request reported as out
    /// of memory. On success, crossing the table's sweep limit runs a
    /// collection unless the collector is paused.
    pub fn allocate(
        &mut self,
        count: usize,
        size: usize,
        finalizer: Option<Finalizer>,
    ) -> GcResult<NonNull<u8>> {
        let total = raw::region_size(count, size).unwrap_or(usize::MAX);

        let mut region = raw::alloc_region(count, size);
        if region.is_null() {
            // Transient out-of-memory: free what we can, then retry once.
            self.run();
            region = raw::alloc_region(count, size);
        }
        let Some(region_nn) = NonNull::new(region) else {
            return Err(GcError::OutOfMemory { size: total });
        };

        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "marten::gc", addr = region as usize, bytes = total, "allocated region");

        if !self.table.put(region, total, finalizer) {
            self.run();
            if !self.table.put(region, total, finalizer) {
                // SAFETY: region came from alloc_region with `total` bytes
                // and was never handed out.
                unsafe { raw::free_region(region, total) };
                return Err(GcError::OutOfMemory { size: total });
            }
        }

        if !self.paused && self.table.len() > self.table.sweep_limit() {
            let _reclaimed = self.run();
            #[cfg(feature = "gc_logging")]
            tracing::debug!(target: "marten::gc", reclaimed = _reclaimed, "sweep limit crossed");
        }

        Ok(region_nn)
    }

    /// Resize a managed region.
    ///
    /// A null `ptr` is a plain allocation without a finaliser. A non-null
    /// `ptr` the table does not know fails with
    /// [`GcError::InvalidArgument`]. When the system reallocator moves
    /// the region, the old record is replaced by one at the returned
    /// address carrying the previous finaliser; tags start over.
    pub fn reallocate(&mut self, ptr: *mut u8, new_size: usize) -> GcResult<NonNull<u8>> {
        if ptr.is_null() {
            let region = raw::alloc_region(0, new_size);
            let Some(region_nn) = NonNull::new(region) else {
                return Err(GcError::OutOfMemory { size: new_size });
            };
            if !self.record_or_release(region, new_size, None) {
                return Err(GcError::OutOfMemory { size: new_size });
            }
            return Ok(region_nn);
        }

        let Some(rec) = self.table.get(ptr) else {
            return Err(GcError::InvalidArgument { addr: ptr as usize });
        };
        let (old_size, finalizer) = (rec.size, rec.finalizer);

        // SAFETY: ptr is managed with old_size bytes (table invariant).
        let moved = unsafe { raw::realloc_region(ptr, old_size, new_size) };
        let Some(moved_nn) = NonNull::new(moved) else {
            // The original region is untouched and stays tracked.
            return Err(GcError::OutOfMemory { size: new_size });
        };

        if moved == ptr {
            if let Some(rec) = self.table.get_mut(ptr) {
                rec.size = new_size;
            }
        } else {
            self.table.remove(ptr);
            if !self.record_or_release(moved, new_size, finalizer) {
                return Err(GcError::OutOfMemory { size: new_size });
            }
        }
        Ok(moved_nn)
    }

    /// Record a fresh region, retrying once through a collection; on
    /// double failure the region is released. True when recorded.
    fn record_or_release(
        &mut self,
        region: *mut u8,
        size: usize,
        finalizer: Option<Finalizer>,
    ) -> bool {
        if self.table.put(region, size, finalizer) {
            return true;
        }
        self.run();
        if self.table.put(region, size, finalizer) {
            return true;
        }
        // SAFETY: region is live, sized `size`, and not in the table.
        unsafe { raw::free_region(region, size) };
        false
    }

    /// Allocate a managed copy of `bytes`.
    pub fn duplicate(&mut self, bytes: &[u8]) -> GcResult<NonNull<u8>> {
        let region = self.alloc(bytes.len())?;
        // SAFETY: the fresh region is bytes.len() bytes and cannot overlap
        // the source.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), region.as_ptr(), bytes.len());
        }
        Ok(region)
    }

    /// Explicitly reclaim a managed region: the finaliser (if any) runs,
    /// the region is released, the record removed. An unknown pointer is
    /// logged and ignored.
    pub fn free(&mut self, ptr: *mut u8) {
        let Some(rec) = self.table.get(ptr) else {
            tracing::warn!(target: "marten::gc", addr = ptr as usize, "ignoring free of unknown pointer");
            return;
        };
        let (size, finalizer) = (rec.size, rec.finalizer);
        if let Some(finalize) = finalizer {
            // SAFETY: the region is still live; finalisers do not re-enter
            // the collector.
            unsafe { finalize(ptr) };
        }
        // SAFETY: ptr is managed with `size` bytes and is dropped from the
        // table right after.
        unsafe { raw::free_region(ptr, size) };
        self.table.remove(ptr);
    }

    // -----------------------------------------------------------------
    // Roots and pausing
    // -----------------------------------------------------------------

    /// Tag a managed region as a root. Roots are marked unconditionally
    /// at the start of every cycle. Unknown pointers have no effect.
    pub fn make_root(&mut self, ptr: *mut u8) {
        if let Some(rec) = self.table.get_mut(ptr) {
            rec.set_root();
        }
    }

    /// Clear the root tag. Unknown pointers have no effect.
    pub fn unroot(&mut self, ptr: *mut u8) {
        if let Some(rec) = self.table.get_mut(ptr) {
            rec.clear_root();
        }
    }

    /// Suppress the automatic sweep-limit trigger in allocation paths.
    /// Explicit [`run`](Self::run) calls are unaffected.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Re-enable automatic collection.
    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Whether automatic collection is currently suppressed.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    // -----------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------

    /// Current collection phase.
    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    /// Whether `ptr` is a managed region start address.
    pub fn is_managed(&self, ptr: *mut u8) -> bool {
        self.table.get(ptr).is_some()
    }

    /// Size of the managed region starting at `ptr`.
    pub fn managed_size(&self, ptr: *mut u8) -> Option<usize> {
        self.table.get(ptr).map(|rec| rec.size)
    }

    /// Number of live managed regions.
    pub fn allocation_count(&self) -> usize {
        self.table.len()
    }

    /// Total bytes across live managed regions.
    pub fn managed_bytes(&self) -> usize {
        self.table.records().map(|rec| rec.size).sum()
    }

    /// Current bucket count of the allocation table.
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    // -----------------------------------------------------------------
    // Collection
    // -----------------------------------------------------------------

    /// Run a full mark-and-sweep cycle. Ignores the paused flag. Returns
    /// the number of bytes reclaimed.
    pub fn run(&mut self) -> usize {
        let start = Instant::now();
        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "marten::gc",
            records = self.table.len(),
            capacity = self.table.capacity(),
            "collection starting"
        );

        self.mark();
        let reclaimed = self.sweep();

        let pause = start.elapsed();
        self.stats.collections += 1;
        self.stats.last_reclaimed = reclaimed;
        self.stats.total_reclaimed += reclaimed;
        self.stats.last_pause = pause;
        self.stats.total_pause += pause;

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "marten::gc",
            reclaimed,
            survivors = self.table.len(),
            pause_us = pause.as_micros() as u64,
            "collection complete"
        );
        reclaimed
    }

    /// Final collection, then metadata teardown. Regions that survive the
    /// final sweep (roots, stack-reachable allocations) are the caller's
    /// to free; the collector forgets them.
    pub fn shutdown(&mut self) -> usize {
        let reclaimed = self.run();
        self.table.clear();
        reclaimed
    }

    fn mark(&mut self) {
        self.phase = GcPhase::Marking;
        self.mark_roots();
        if self.scan_stack {
            // Flush volatile register state into the frame below, then
            // enter the scan through an opaque call.
            stack::flush_registers_and_call(|| self.mark_stack());
        }
    }

    fn mark_roots(&mut self) {
        let roots: Vec<*mut u8> = self
            .table
            .records()
            .filter(|rec| rec.is_root())
            .map(|rec| rec.ptr)
            .collect();
        for ptr in roots {
            self.mark_candidate(ptr as usize);
        }
    }

    /// Walk every word between the live top of stack and the base
    /// sentinel, treating each as a candidate managed address.
    #[inline(never)]
    fn mark_stack(&mut self) {
        let top = stack::current_top();
        for word in stack::words_between(top, self.stack_base.addr()) {
            self.mark_candidate(word);
        }
    }

    /// Mark the record for `addr` if it exists, then trace through the
    /// region graph with an explicit worklist. Region bytes are rescanned
    /// at single-byte stride: managed regions may carry unaligned
    /// embedded pointers.
    fn mark_candidate(&mut self, addr: usize) {
        let mut worklist: Vec<(usize, usize)> = Vec::new();

        match self.table.get_mut(addr as *mut u8) {
            Some(rec) if !rec.is_marked() => {
                rec.set_mark();
                worklist.push((addr, rec.size));
            }
            _ => return,
        }

        while let Some((base, size)) = worklist.pop() {
            if size < WORD {
                continue;
            }
            for offset in 0..=(size - WORD) {
                // SAFETY: base..base+size is a live managed region; the
                // read stays in bounds and the value is treated as an
                // integer candidate only.
                let candidate =
                    unsafe { std::ptr::read_unaligned((base + offset) as *const usize) };
                if let Some(rec) = self.table.get_mut(candidate as *mut u8)
                    && !rec.is_marked()
                {
                    rec.set_mark();
                    worklist.push((candidate, rec.size));
                }
            }
        }
    }

    fn sweep(&mut self) -> usize {
        self.phase = GcPhase::Sweeping;
        let dead = self.table.sweep();
        let removed_any = !dead.is_empty();
        let mut reclaimed = 0;
        for rec in dead {
            if let Some(finalize) = rec.finalizer {
                // SAFETY: the region is still live here; finalisers do not
                // re-enter the collector.
                unsafe { finalize(rec.ptr) };
            }
            // SAFETY: rec.ptr is a managed region of rec.size bytes whose
            // record has already been unlinked.
            unsafe { raw::free_region(rec.ptr, rec.size) };
            reclaimed += rec.size;
        }
        // Only an actual removal can change the load factor; a sweep that
        // reclaims nothing must not resize the table.
        if removed_any {
            self.table.downsize_to_load();
        }
        self.phase = GcPhase::Idle;
        reclaimed
    }
}
