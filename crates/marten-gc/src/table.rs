//! Address-keyed allocation table.
//!
//! A separately-chained hash table owning every [`AllocationRecord`].
//! Capacity is always prime and never drops below the configured floor;
//! growth and shrinkage are driven by load factors. Independently of the
//! load factors, the table carries a sweep limit: an absolute live-record
//! count that, once exceeded, tells the collector to run on the next
//! allocation.

use crate::primes::next_prime;
use crate::raw;
use crate::record::{AllocationRecord, Finalizer};

type Link = Option<Box<AllocationRecord>>;

pub(crate) struct AllocationTable {
    buckets: Vec<Link>,
    min_capacity: usize,
    size: usize,
    downsize_factor: f64,
    upsize_factor: f64,
    sweep_factor: f64,
    sweep_limit: usize,
}

impl AllocationTable {
    pub fn new(
        min_capacity: usize,
        capacity: usize,
        sweep_factor: f64,
        downsize_factor: f64,
        upsize_factor: f64,
    ) -> Self {
        let min_capacity = next_prime(min_capacity);
        let capacity = next_prime(capacity).max(min_capacity);
        Self {
            buckets: fresh_buckets(capacity),
            min_capacity,
            size: 0,
            downsize_factor,
            upsize_factor,
            sweep_factor,
            sweep_limit: (sweep_factor * capacity as f64) as usize,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn sweep_limit(&self) -> usize {
        self.sweep_limit
    }

    fn load_factor(&self) -> f64 {
        self.size as f64 / self.capacity() as f64
    }

    fn bucket_index(&self, ptr: *mut u8) -> usize {
        hash(ptr) % self.capacity()
    }

    /// Upsert. An existing record for `ptr` is updated in place, keeping
    /// its chain position and successor (the reallocation path lands
    /// here); a fresh record is prepended to its bucket. Returns false
    /// when the metadata node cannot be allocated.
    pub fn put(&mut self, ptr: *mut u8, size: usize, finalizer: Option<Finalizer>) -> bool {
        let index = self.bucket_index(ptr);
        let mut cur = &mut self.buckets[index];
        while let Some(rec) = cur {
            if rec.ptr == ptr {
                rec.size = size;
                rec.finalizer = finalizer;
                return true;
            }
            cur = &mut rec.next;
        }

        let Some(mut rec) = raw::try_box(AllocationRecord::new(ptr, size, finalizer)) else {
            return false;
        };
        rec.next = self.buckets[index].take();
        self.buckets[index] = Some(rec);
        self.size += 1;

        if self.load_factor() > self.upsize_factor {
            self.resize(next_prime(self.capacity() * 2));
        }
        true
    }

    /// Exact-address lookup; interior pointers do not match.
    pub fn get(&self, ptr: *mut u8) -> Option<&AllocationRecord> {
        let mut cur = self.buckets[self.bucket_index(ptr)].as_deref();
        while let Some(rec) = cur {
            if rec.ptr == ptr {
                return Some(rec);
            }
            cur = rec.next.as_deref();
        }
        None
    }

    pub fn get_mut(&mut self, ptr: *mut u8) -> Option<&mut AllocationRecord> {
        let index = self.bucket_index(ptr);
        let mut cur = self.buckets[index].as_deref_mut();
        while let Some(rec) = cur {
            if rec.ptr == ptr {
                return Some(rec);
            }
            cur = rec.next.as_deref_mut();
        }
        None
    }

    /// Unlink the record for `ptr`, then check for a downsize. Unknown
    /// keys skip the unlink but still reach the load-factor check.
    /// Holding the link itself as the cursor keeps the predecessor
    /// correct whether the match is the bucket head or an interior node.
    pub fn remove(&mut self, ptr: *mut u8) {
        let index = self.bucket_index(ptr);
        let mut cur = &mut self.buckets[index];
        loop {
            match cur.take() {
                None => break,
                Some(mut rec) => {
                    if rec.ptr == ptr {
                        *cur = rec.next.take();
                        self.size -= 1;
                        break;
                    }
                    *cur = Some(rec);
                    cur = &mut cur.as_mut().unwrap().next;
                }
            }
        }
        if self.load_factor() < self.downsize_factor {
            self.resize(next_prime(self.capacity() / 2));
        }
    }

    /// Rehash into `new_capacity` buckets, moving records in place, and
    /// recompute the sweep limit. Any target at or below the floor is
    /// refused.
    fn resize(&mut self, new_capacity: usize) {
        if new_capacity <= self.min_capacity {
            return;
        }
        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "marten::gc",
            from = self.capacity(),
            to = new_capacity,
            records = self.size,
            "resizing allocation table"
        );
        let old = std::mem::replace(&mut self.buckets, fresh_buckets(new_capacity));
        for mut head in old {
            while let Some(mut rec) = head {
                head = rec.next.take();
                let index = hash(rec.ptr) % new_capacity;
                rec.next = self.buckets[index].take();
                self.buckets[index] = Some(rec);
            }
        }
        self.sweep_limit = self.size
            + (self.sweep_factor * new_capacity.saturating_sub(self.size) as f64) as usize;
    }

    /// Unlink every unmarked record and clear the mark bit on survivors.
    /// Dead records are handed back so the caller can finalise them and
    /// release their regions; no downsize happens here (see
    /// [`Self::downsize_to_load`]).
    pub fn sweep(&mut self) -> Vec<Box<AllocationRecord>> {
        let mut dead = Vec::new();
        for i in 0..self.buckets.len() {
            let mut cur = &mut self.buckets[i];
            loop {
                match cur.take() {
                    None => break,
                    Some(mut rec) => {
                        if rec.is_marked() {
                            rec.clear_mark();
                            *cur = Some(rec);
                            cur = &mut cur.as_mut().unwrap().next;
                        } else {
                            *cur = rec.next.take();
                            self.size -= 1;
                            dead.push(rec);
                        }
                    }
                }
            }
        }
        dead
    }

    /// Downsize check after bulk removal, cascading until the load factor
    /// stabilises above the threshold or the floor is reached.
    pub fn downsize_to_load(&mut self) {
        while self.load_factor() < self.downsize_factor {
            let target = next_prime(self.capacity() / 2);
            if target <= self.min_capacity {
                break;
            }
            self.resize(target);
        }
    }

    /// Every record, bucket by bucket.
    pub fn records(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.buckets.iter().flat_map(|head| ChainIter {
            cur: head.as_deref(),
        })
    }

    /// Drop all metadata without touching the managed regions.
    pub fn clear(&mut self) {
        for head in &mut self.buckets {
            let mut cur = head.take();
            while let Some(mut rec) = cur {
                cur = rec.next.take();
            }
        }
        self.size = 0;
    }
}

impl Drop for AllocationTable {
    fn drop(&mut self) {
        // Unlink iteratively so a long chain cannot recurse through Box
        // drops.
        self.clear();
    }
}

struct ChainIter<'a> {
    cur: Option<&'a AllocationRecord>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a AllocationRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let rec = self.cur?;
        self.cur = rec.next.as_deref();
        Some(rec)
    }
}

fn fresh_buckets(capacity: usize) -> Vec<Link> {
    let mut buckets = Vec::with_capacity(capacity);
    buckets.resize_with(capacity, || None);
    buckets
}

fn hash(ptr: *mut u8) -> usize {
    // Regions are at least 8-aligned, so the low bits carry no entropy.
    (ptr as usize) >> 3
}
