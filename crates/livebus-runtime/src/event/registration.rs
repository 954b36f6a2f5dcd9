#![forbid(unsafe_code)]

//! Observer handles and per-channel registrations.
//!
//! An [`Observer<T>`] is the subscriber callback as seen by users. Its
//! identity is the callback allocation: clones are the same observer, two
//! separately created observers are different even when their closures are
//! identical.
//!
//! A `Registration<T>` is the channel's bookkeeping for one observer:
//! whether it is active, which version it last saw, whether the next
//! delivery is suppressed, and what gates its activity.
//!
//! # State machine
//!
//! ```text
//! Unattached ─attach─► Attached(inactive) ◄──► Attached(active)
//!                              │                     │
//!                              └──remove / owner destroyed──► Detached
//! ```
//!
//! `Detached` is terminal: a detached registration never becomes active
//! again, and re-observing creates a fresh registration.

use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use livebus_core::lifecycle::{Lifecycle, LifecycleObserver, State};

use super::channel::ChannelCore;
use super::value::NO_VALUE;

/// Identity of an observer within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverKey(usize);

impl ObserverKey {
    fn of<P: ?Sized>(ptr: *const P) -> Self {
        Self(ptr.cast::<()>() as usize)
    }
}

/// Subscriber callback for values of type `T`, usable on the main context.
///
/// ```
/// use livebus_runtime::Observer;
///
/// let a = Observer::new(|v: &u32| println!("{v}"));
/// let b = a.clone();
/// assert_eq!(a.key(), b.key());
/// ```
pub struct Observer<T> {
    callback: Rc<dyn Fn(&T)>,
}

impl<T> Clone for Observer<T> {
    fn clone(&self) -> Self {
        Self {
            callback: Rc::clone(&self.callback),
        }
    }
}

impl<T> fmt::Debug for Observer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Observer").field(&self.key()).finish()
    }
}

impl<T> Observer<T> {
    /// Wrap `callback` as a new observer identity.
    pub fn new(callback: impl Fn(&T) + 'static) -> Self {
        Self {
            callback: Rc::new(callback),
        }
    }

    /// Identity of this observer.
    #[must_use]
    pub fn key(&self) -> ObserverKey {
        ObserverKey::of(Rc::as_ptr(&self.callback))
    }

    pub(crate) fn notify(&self, value: &T) {
        (self.callback)(value);
    }
}

/// Thread-safe subscriber callback, for registrations requested from
/// producer threads through a `RemoteChannel`.
///
/// Callbacks still run on the main context.
pub struct SyncObserver<T> {
    callback: Arc<dyn Fn(&T) + Send + Sync>,
}

impl<T> Clone for SyncObserver<T> {
    fn clone(&self) -> Self {
        Self {
            callback: Arc::clone(&self.callback),
        }
    }
}

impl<T> fmt::Debug for SyncObserver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SyncObserver").field(&self.key()).finish()
    }
}

impl<T> SyncObserver<T> {
    /// Identity of this observer.
    #[must_use]
    pub fn key(&self) -> ObserverKey {
        ObserverKey::of(Arc::as_ptr(&self.callback))
    }
}

impl<T: 'static> SyncObserver<T> {
    /// Wrap `callback` as a new observer identity.
    pub fn new(callback: impl Fn(&T) + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Main-context view of this observer, keeping the same identity.
    pub(crate) fn to_local(&self) -> (ObserverKey, Observer<T>) {
        let callback = Arc::clone(&self.callback);
        (
            self.key(),
            Observer {
                callback: Rc::new(move |value: &T| callback(value)),
            },
        )
    }
}

/// What gates a registration's activity.
pub(crate) enum Binding {
    /// Active while the owner is started or resumed. `link` is the
    /// registration's [`LifecycleLink`] as added to the owner.
    Owner {
        owner: Weak<dyn Lifecycle>,
        link: Rc<dyn LifecycleObserver>,
    },
    /// Always active until removed.
    Forever,
}

/// One observer attached to one channel.
pub(crate) struct Registration<T> {
    /// Insertion order within the channel.
    pub(crate) seq: u64,
    pub(crate) key: ObserverKey,
    pub(crate) observer: Observer<T>,
    pub(crate) binding: Binding,
    pub(crate) active: Cell<bool>,
    pub(crate) last_version: Cell<i64>,
    pub(crate) skip_next: Cell<bool>,
    pub(crate) detached: Cell<bool>,
}

impl<T> fmt::Debug for Registration<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.binding {
            Binding::Owner { .. } => "owner",
            Binding::Forever => "forever",
        };
        f.debug_struct("Registration")
            .field("seq", &self.seq)
            .field("key", &self.key)
            .field("kind", &kind)
            .field("active", &self.active.get())
            .field("last_version", &self.last_version.get())
            .field("skip_next", &self.skip_next.get())
            .field("detached", &self.detached.get())
            .finish()
    }
}

impl<T: 'static> Registration<T> {
    /// Registration that stays active until removed.
    pub(crate) fn forever(
        seq: u64,
        key: ObserverKey,
        observer: Observer<T>,
        skip_next: bool,
    ) -> Rc<Self> {
        Rc::new(Self::with_binding(seq, key, observer, Binding::Forever, skip_next))
    }

    /// Registration gated by `owner`. The returned link must be added to the
    /// owner's observers by the caller.
    pub(crate) fn bound(
        seq: u64,
        key: ObserverKey,
        observer: Observer<T>,
        owner: &Rc<dyn Lifecycle>,
        channel: Weak<ChannelCore<T>>,
        skip_next: bool,
    ) -> Rc<Self> {
        Rc::new_cyclic(|registration| {
            let link: Rc<dyn LifecycleObserver> = Rc::new(LifecycleLink {
                channel,
                registration: registration.clone(),
            });
            let binding = Binding::Owner {
                owner: Rc::downgrade(owner),
                link,
            };
            Self::with_binding(seq, key, observer, binding, skip_next)
        })
    }

    fn with_binding(
        seq: u64,
        key: ObserverKey,
        observer: Observer<T>,
        binding: Binding,
        skip_next: bool,
    ) -> Self {
        Self {
            seq,
            key,
            observer,
            binding,
            active: Cell::new(false),
            last_version: Cell::new(NO_VALUE),
            skip_next: Cell::new(skip_next),
            detached: Cell::new(false),
        }
    }
}

impl<T> Registration<T> {
    /// Whether the registration ought to be active right now.
    ///
    /// An owner that has been dropped counts as inactive.
    pub(crate) fn should_be_active(&self) -> bool {
        if self.detached.get() {
            return false;
        }
        match &self.binding {
            Binding::Owner { owner, .. } => owner
                .upgrade()
                .is_some_and(|owner| owner.current_state().is_active()),
            Binding::Forever => true,
        }
    }

    /// Whether this registration is gated by `owner`.
    pub(crate) fn is_attached_to(&self, owner: &Rc<dyn Lifecycle>) -> bool {
        match &self.binding {
            Binding::Owner { owner: bound, .. } => {
                std::ptr::addr_eq(bound.as_ptr(), Rc::as_ptr(owner))
            }
            Binding::Forever => false,
        }
    }

    pub(crate) fn is_forever(&self) -> bool {
        matches!(self.binding, Binding::Forever)
    }

    /// Link to add to the owner, if lifecycle-bound.
    pub(crate) fn lifecycle_link(&self) -> Option<Rc<dyn LifecycleObserver>> {
        match &self.binding {
            Binding::Owner { link, .. } => Some(Rc::clone(link)),
            Binding::Forever => None,
        }
    }

    /// Stop listening to the owner and mark the registration terminal.
    pub(crate) fn detach(&self) {
        self.detached.set(true);
        if let Binding::Owner { owner, link } = &self.binding {
            if let Some(owner) = owner.upgrade() {
                owner.remove_observer(link);
            }
        }
    }
}

/// Lifecycle observer that forwards owner transitions to its channel.
pub(crate) struct LifecycleLink<T> {
    channel: Weak<ChannelCore<T>>,
    registration: Weak<Registration<T>>,
}

impl<T: 'static> LifecycleObserver for LifecycleLink<T> {
    fn on_state_changed(&self, state: State) {
        let (Some(channel), Some(registration)) =
            (self.channel.upgrade(), self.registration.upgrade())
        else {
            return;
        };
        if state == State::Destroyed {
            channel.remove_registration(&registration);
            return;
        }
        channel.set_active(&registration, registration.should_be_active());
    }
}
