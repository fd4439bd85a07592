use std::{
    fmt::{Debug, Formatter},
    ptr,
    sync::{
        atomic::{AtomicPtr, Ordering},
        Arc,
    },
};

/// An owning pointer that can be converted to a raw pointer and back without changing
/// ownership. Implemented for the two pointer types the runtime stores in slots.
///
/// # Safety
///
/// `from_raw(into_raw(p))` must give back `p`, and a raw pointer produced by `into_raw` must
/// stay valid until it is passed to `from_raw` exactly once.
pub unsafe trait SlotPointer: Sized {
    type Target;
    fn into_raw(self) -> *mut Self::Target;
    /// # Safety
    ///
    /// `raw` must come from [`SlotPointer::into_raw`] and must not have been reclaimed yet.
    unsafe fn from_raw(raw: *mut Self::Target) -> Self;
}

unsafe impl<T> SlotPointer for Box<T> {
    type Target = T;

    fn into_raw(self) -> *mut T {
        Box::into_raw(self)
    }

    unsafe fn from_raw(raw: *mut T) -> Self {
        Box::from_raw(raw)
    }
}

unsafe impl<T> SlotPointer for Arc<T> {
    type Target = T;

    fn into_raw(self) -> *mut T {
        Arc::into_raw(self) as *mut T
    }

    unsafe fn from_raw(raw: *mut T) -> Self {
        Arc::from_raw(raw)
    }
}

/// A cell holding at most one owned pointer, exchanged atomically.
///
/// [`AtomicSlot::publish`] is a release operation and [`AtomicSlot::take`] an acquire one, so
/// everything the publisher wrote before publishing is visible to whoever takes the value. A
/// value can be taken at most once.
pub struct AtomicSlot<P: SlotPointer> {
    raw: AtomicPtr<P::Target>,
}

impl<P: SlotPointer> AtomicSlot<P> {
    pub const fn empty() -> Self {
        AtomicSlot {
            raw: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Stores `value`, returning whatever was there before.
    pub fn publish(&self, value: P) -> Option<P> {
        let previous = self.raw.swap(value.into_raw(), Ordering::AcqRel);
        // SAFETY: Every non-null pointer in the slot came from `into_raw`, and the swap gave us
        //         exclusive ownership of it.
        (!previous.is_null()).then(|| unsafe { P::from_raw(previous) })
    }

    pub fn take(&self) -> Option<P> {
        let raw = self.raw.swap(ptr::null_mut(), Ordering::Acquire);
        // SAFETY: As in `publish`.
        (!raw.is_null()).then(|| unsafe { P::from_raw(raw) })
    }

    pub fn is_empty(&self) -> bool {
        self.raw.load(Ordering::Acquire).is_null()
    }
}

impl<P: SlotPointer> Default for AtomicSlot<P> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<P: SlotPointer> Debug for AtomicSlot<P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicSlot")
            .field("occupied", &!self.is_empty())
            .finish()
    }
}

impl<P: SlotPointer> Drop for AtomicSlot<P> {
    fn drop(&mut self) {
        drop(self.take());
    }
}

// SAFETY: The slot only moves `P` between threads, never shares it.
unsafe impl<P: SlotPointer + Send> Send for AtomicSlot<P> {}
unsafe impl<P: SlotPointer + Send> Sync for AtomicSlot<P> {}

#[cfg(test)]
mod test {
    use {super::*, std::thread};

    #[test]
    fn take_consumes_the_published_value() {
        let slot = AtomicSlot::<Box<u32>>::empty();
        assert!(slot.take().is_none());
        assert!(slot.publish(Box::new(5)).is_none());
        assert_eq!(slot.publish(Box::new(6)).map(|b| *b), Some(5));
        assert_eq!(slot.take().map(|b| *b), Some(6));
        assert!(slot.take().is_none());
        assert!(slot.is_empty());
    }

    #[test]
    fn drop_releases_an_unclaimed_value() {
        let value = Arc::new(());
        {
            let slot = AtomicSlot::empty();
            slot.publish(Arc::clone(&value));
            assert_eq!(Arc::strong_count(&value), 2);
        }
        assert_eq!(Arc::strong_count(&value), 1);
    }

    #[test]
    fn a_value_is_taken_by_exactly_one_thread() {
        for _ in 0..200 {
            let slot = Arc::new(AtomicSlot::<Box<usize>>::empty());
            slot.publish(Box::new(1));
            let takers: Vec<_> = (0..4)
                .map(|_| {
                    let slot = Arc::clone(&slot);
                    thread::spawn(move || slot.take().map_or(0, |b| *b))
                })
                .collect();
            let total: usize = takers.into_iter().map(|t| t.join().unwrap()).sum();
            assert_eq!(total, 1);
        }
    }
}
