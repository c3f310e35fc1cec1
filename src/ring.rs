//! Lock-free MPMC pointer ring: the chunk pool.
//!
//! Bounded queue of non-null pointers, safe for any number of concurrent
//! producers and consumers. Almost wait-free: admission is a single
//! counter round-trip, and landing an element retries only against
//! contenders on the same slot. No order guarantee across threads,
//! though in practice it is close to FIFO.
//!
//! Two admission counters bound slot traffic, two monotonic cursors
//! spread contenders across slots. The alternative single-counter scheme
//! with a CAS on a head/tail pair has the same progress properties but
//! worse false-sharing behavior, so the counter pair stays.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// Cache-line aligned wrapper to prevent false sharing.
#[repr(align(64))]
pub struct CachePadded<T>(pub T);

impl<T> CachePadded<T> {
    pub const fn new(val: T) -> Self {
        Self(val)
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;
    #[inline(always)]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> std::ops::DerefMut for CachePadded<T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// Bounded MPMC queue of non-null pointers.
///
/// Capacity is fixed at construction. `try_enqueue` / `try_dequeue`
/// never block and never spin on a condition; each completes in a
/// bounded number of retries against operations contending for the same
/// slot. Under adversarial scheduling a thread can in theory lose its
/// target slot forever; under any real scheduler it resolves in a few
/// steps.
pub struct PtrRing<T> {
    slots: Box<[AtomicPtr<T>]>,
    capacity: u64,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    /// Occupancy booked by producers. Starts at 0, a producer passes
    /// while the post-increment stays <= capacity; a dequeue gives the
    /// booking back.
    space_sem: CachePadded<AtomicU64>,
    /// Mirror for consumers. Starts at capacity; an enqueue subtracts
    /// one, so a consumer passes while at least one landed element
    /// remains unclaimed.
    elem_sem: CachePadded<AtomicU64>,
    owns_elems: bool,
}

// SAFETY: the ring hands pointers between threads; the pointees must be
// safe to send. The slot array itself is only touched through atomics.
unsafe impl<T: Send> Send for PtrRing<T> {}
unsafe impl<T: Send> Sync for PtrRing<T> {}

impl<T> PtrRing<T> {
    /// Ring that does not own its elements: dropping it releases only
    /// the slot array.
    pub fn new(capacity: usize) -> Self {
        Self::with_ownership(capacity, false)
    }

    /// Ring that owns its elements: dropping it dequeues every remaining
    /// pointer and reclaims it as a `Box<T>`.
    ///
    /// Every element enqueued into an owning ring must have been
    /// produced by `Box::into_raw`.
    pub fn new_owning(capacity: usize) -> Self {
        Self::with_ownership(capacity, true)
    }

    fn with_ownership(capacity: usize, owns_elems: bool) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        let slots: Vec<AtomicPtr<T>> = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
            capacity: capacity as u64,
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            space_sem: CachePadded::new(AtomicU64::new(0)),
            elem_sem: CachePadded::new(AtomicU64::new(capacity as u64)),
            owns_elems,
        }
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Push a pointer. Fails iff the ring already holds `capacity`
    /// elements, handing the element back.
    pub fn try_enqueue(&self, elem: NonNull<T>) -> Result<(), NonNull<T>> {
        if !self.book_space() {
            return Err(elem);
        }

        // Space is booked: some slot must accept the element. A consumer
        // that drew this slot before the previous occupant was cleared
        // re-draws, so the CAS can fail; keep drawing fresh slots. The
        // booking is never rolled back.
        loop {
            let slot = (self.tail.fetch_add(1, Ordering::SeqCst) % self.capacity) as usize;

            let landed = self.slots[slot]
                .compare_exchange(
                    ptr::null_mut(),
                    elem.as_ptr(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok();

            if landed {
                self.elem_sem.fetch_sub(1, Ordering::SeqCst);
                return Ok(());
            }
        }
    }

    /// Pop a pointer, or `None` if the ring is empty.
    pub fn try_dequeue(&self) -> Option<NonNull<T>> {
        if !self.book_elem() {
            return None;
        }

        // At least one landed element is reserved for us. A booked
        // producer may not have reached our drawn slot yet; on a null
        // read, draw again rather than abort.
        loop {
            let slot = (self.head.fetch_add(1, Ordering::SeqCst) % self.capacity) as usize;

            let elem = self.slots[slot].swap(ptr::null_mut(), Ordering::SeqCst);

            if let Some(elem) = NonNull::new(elem) {
                self.space_sem.fetch_sub(1, Ordering::SeqCst);
                return Some(elem);
            }
        }
    }

    #[inline]
    fn book_space(&self) -> bool {
        let booked = self.space_sem.fetch_add(1, Ordering::SeqCst) + 1;
        if booked <= self.capacity {
            return true;
        }
        self.space_sem.fetch_sub(1, Ordering::SeqCst);
        false
    }

    #[inline]
    fn book_elem(&self) -> bool {
        let booked = self.elem_sem.fetch_add(1, Ordering::SeqCst) + 1;
        if booked <= self.capacity {
            return true;
        }
        self.elem_sem.fetch_sub(1, Ordering::SeqCst);
        false
    }
}

impl<T> Drop for PtrRing<T> {
    fn drop(&mut self) {
        if !self.owns_elems {
            return;
        }
        while let Some(elem) = self.try_dequeue() {
            // SAFETY: owning rings only accept pointers from
            // Box::into_raw, per the new_owning contract.
            drop(unsafe { Box::from_raw(elem.as_ptr()) });
        }
    }
}
