//! Shared ownership with named, traced reservations.
//!
//! Every long-lived hold on a node is taken through [`Shared::reserve`] with
//! a short tag naming the holder, and released by dropping the returned
//! [`Reservation`]. Because release is the guard's destructor, every reserve
//! is structurally paired with a release of the same tag. The tags have no
//! runtime semantics; they exist so a trace of reserve/release lines can be
//! balanced by eye when chasing a lifetime bug.
//!
//! Tag key, carried over from the reference-count discipline this replaces:
//! `C` cluster node list, `L` tend task, `I` info probe, `R` replicas fetch,
//! `PR`/`PW` partition cells, `T` transaction lease.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::trace;

struct Inner<T> {
    value: T,
    reservations: AtomicUsize,
}

/// A shared handle to `T`. Cloning is plain `Arc` sharing and is not counted;
/// only [`reserve`](Shared::reserve) takes a counted, tagged hold.
pub struct Shared<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Shared<T> {
    /// Wraps `value` for shared ownership. No reservations are outstanding.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                value,
                reservations: AtomicUsize::new(0),
            }),
        }
    }

    /// Takes a tagged reservation. The hold lasts until the returned guard
    /// is dropped.
    pub fn reserve(&self, tag: &'static str) -> Reservation<T> {
        let count = self.inner.reservations.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(tag, count, "reserve");
        Reservation {
            shared: self.clone(),
            tag,
        }
    }

    /// Number of outstanding reservations.
    pub fn live(&self) -> usize {
        self.inner.reservations.load(Ordering::Relaxed)
    }

    /// Identity comparison: do both handles point at the same value?
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("value", &self.inner.value)
            .field("reservations", &self.live())
            .finish()
    }
}

/// A tagged hold on a [`Shared`] value. Dropping releases the hold and
/// traces the release under the tag it was reserved with.
pub struct Reservation<T> {
    shared: Shared<T>,
    tag: &'static str,
}

impl<T> Reservation<T> {
    /// The tag this reservation was taken under.
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Borrows the underlying shared handle (e.g. to take further
    /// reservations under other tags).
    pub fn shared(&self) -> &Shared<T> {
        &self.shared
    }
}

impl<T> Deref for Reservation<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.shared.inner.value
    }
}

impl<T> Drop for Reservation<T> {
    fn drop(&mut self) {
        let count = self
            .shared
            .inner
            .reservations
            .fetch_sub(1, Ordering::Relaxed)
            - 1;
        trace!(tag = self.tag, count, "release");
    }
}

impl<T: fmt::Debug> fmt::Debug for Reservation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("tag", &self.tag)
            .field("value", &self.shared.inner.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_has_no_reservations() {
        let shared = Shared::new(7u32);
        assert_eq!(shared.live(), 0);
    }

    #[test]
    fn reserve_and_drop_balance() {
        let shared = Shared::new("node".to_string());

        let a = shared.reserve("C");
        let b = shared.reserve("L");
        assert_eq!(shared.live(), 2);
        assert_eq!(a.tag(), "C");
        assert_eq!(b.tag(), "L");

        drop(a);
        assert_eq!(shared.live(), 1);
        drop(b);
        assert_eq!(shared.live(), 0);
    }

    #[test]
    fn clone_is_not_counted() {
        let shared = Shared::new(1u8);
        let other = shared.clone();
        assert_eq!(shared.live(), 0);
        assert!(shared.ptr_eq(&other));
    }

    #[test]
    fn reservation_derefs_to_value() {
        let shared = Shared::new(vec![1, 2, 3]);
        let res = shared.reserve("T");
        assert_eq!(res.len(), 3);
        assert_eq!(res.shared().live(), 1);
    }

    #[test]
    fn value_dropped_with_last_handle() {
        struct DropFlag(Arc<AtomicUsize>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let shared = Shared::new(DropFlag(Arc::clone(&drops)));
        let res = shared.reserve("T");

        drop(shared);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(res);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ptr_eq_distinguishes_values() {
        let a = Shared::new(0u8);
        let b = Shared::new(0u8);
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn concurrent_reserve_release_balances() {
        let shared = Shared::new(());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let res = shared.reserve("T");
                        drop(res);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(shared.live(), 0);
    }
}
