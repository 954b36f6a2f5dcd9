#![forbid(unsafe_code)]

//! Versioned value holder with a single-slot cross-thread mailbox.
//!
//! # Design
//!
//! [`VersionedValue<T>`] keeps the retained value of a channel and a version
//! counter starting at [`NO_VALUE`]. Both are only touched on the main
//! context, so they live in `Cell`/`RefCell` without locking.
//!
//! Producers on other threads write into a [`Mailbox<T>`] instead: one slot
//! behind one mutex. The first write into an empty slot asks the caller to
//! schedule a drain on the main context; later writes before the drain simply
//! replace the queued value (last write wins).
//!
//! # Invariants
//!
//! 1. `version` increases by exactly 1 per [`VersionedValue::set`] and never
//!    decreases.
//! 2. `current` is `None` (unset) exactly while `version == NO_VALUE`.
//! 3. At most one drain is scheduled per mailbox at any time.
//! 4. The mailbox lock is held only for a single slot read-modify-write.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Version of a channel that has never been set.
pub const NO_VALUE: i64 = -1;

/// Single-slot staging area for values posted from other threads.
pub(crate) struct Mailbox<T> {
    pending: Mutex<Option<T>>,
}

impl<T> Mailbox<T> {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(None),
        }
    }

    /// Store `value`, replacing any queued value.
    ///
    /// Returns `true` when the slot was empty, i.e. the caller must schedule
    /// a drain. Returns `false` when a drain is already scheduled.
    pub(crate) fn offer(&self, value: T) -> bool {
        let mut slot = self.lock();
        let was_empty = slot.is_none();
        *slot = Some(value);
        was_empty
    }

    /// Take the queued value, leaving the slot empty.
    pub(crate) fn take(&self) -> Option<T> {
        self.lock().take()
    }

    pub(crate) fn is_occupied(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        // A panic cannot interrupt a slot swap halfway, so poisoning is benign.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Retained value and version counter of one channel.
pub struct VersionedValue<T> {
    version: Cell<i64>,
    current: RefCell<Option<Rc<T>>>,
}

impl<T> fmt::Debug for VersionedValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedValue")
            .field("version", &self.version.get())
            .field("is_set", &self.current.borrow().is_some())
            .finish()
    }
}

impl<T> Default for VersionedValue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> VersionedValue<T> {
    /// Create an unset value at version [`NO_VALUE`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: Cell::new(NO_VALUE),
            current: RefCell::new(None),
        }
    }

    /// Replace the value and bump the version. Returns the new version.
    pub fn set(&self, value: T) -> i64 {
        let version = self.version.get() + 1;
        self.version.set(version);
        *self.current.borrow_mut() = Some(Rc::new(value));
        version
    }

    /// Current version, [`NO_VALUE`] if never set.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.version.get()
    }

    /// Current value, `None` if never set.
    ///
    /// The returned `Rc` is detached from the holder: a later `set` does not
    /// affect it.
    #[must_use]
    pub fn current(&self) -> Option<Rc<T>> {
        self.current.borrow().clone()
    }

    /// Whether a value has ever been set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.current.borrow().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn starts_unset_at_sentinel() {
        let value = VersionedValue::<i32>::new();
        assert_eq!(value.version(), NO_VALUE);
        assert!(value.current().is_none());
        assert!(!value.is_set());
    }

    #[test]
    fn set_bumps_version_by_one() {
        let value = VersionedValue::new();
        assert_eq!(value.set("a"), 0);
        assert_eq!(value.set("b"), 1);
        assert_eq!(value.version(), 1);
        assert_eq!(*value.current().unwrap(), "b");
    }

    #[test]
    fn none_payload_is_distinct_from_unset() {
        let value = VersionedValue::<Option<u8>>::new();
        value.set(None);
        assert!(value.is_set());
        assert_eq!(*value.current().unwrap(), None);
    }

    #[test]
    fn retained_rc_survives_overwrite() {
        let value = VersionedValue::new();
        value.set(String::from("first"));
        let held = value.current().unwrap();
        value.set(String::from("second"));
        assert_eq!(*held, "first");
    }

    #[test]
    fn mailbox_requests_one_drain_per_burst() {
        let mailbox = Mailbox::new();
        assert!(mailbox.offer(1));
        assert!(!mailbox.offer(2));
        assert!(!mailbox.offer(3));
        assert!(mailbox.is_occupied());

        assert_eq!(mailbox.take(), Some(3));
        assert!(!mailbox.is_occupied());
        assert_eq!(mailbox.take(), None);

        // Drained: the next offer schedules again.
        assert!(mailbox.offer(4));
    }

    #[test]
    fn concurrent_offers_schedule_exactly_once() {
        let mailbox = Arc::new(Mailbox::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let mailbox = Arc::clone(&mailbox);
                thread::spawn(move || mailbox.offer(i))
            })
            .collect();

        let scheduled = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|first| *first)
            .count();

        assert_eq!(scheduled, 1);
        assert!(mailbox.take().is_some());
    }
}
