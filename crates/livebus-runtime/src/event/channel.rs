#![forbid(unsafe_code)]

//! Event channels: one retained value, many lifecycle-gated observers.
//!
//! # Design
//!
//! [`EventChannel<T>`] is a cheap handle (`Rc`) to the channel state. The
//! state lives on the main context and is never shared across threads; the
//! handle is therefore `!Send`, which turns "subscription changes must
//! happen on the main context" into a compile-time guarantee. Producers on
//! other threads use [`RemoteChannel<T>`] instead.
//!
//! # Posting
//!
//! | Operation       | On main context    | Elsewhere                           |
//! |-----------------|--------------------|-------------------------------------|
//! | `post`          | applied at once    | coalescing mailbox, last write wins |
//! | `post_orderly`  | queued (FIFO)      | queued (FIFO)                       |
//! | `post_delay`    | queued after delay | queued after delay                  |
//!
//! # Observing
//!
//! `observe*` calls differ in two ways: whether a lifecycle owner gates
//! delivery, and whether a value posted before the call is delivered
//! ("sticky"). Non-sticky registrations suppress exactly one catch-up
//! delivery when a value already exists.
//!
//! # Failure Modes
//!
//! - **Same observer, different owner**: rejected with
//!   [`ChannelError::OwnerConflict`]; the existing registration is kept.
//! - **Owner already destroyed**: the call is ignored.
//! - **Panicking observer**: the panic propagates to the caller of the
//!   operation that triggered the delivery. Observers later in that sweep
//!   are not notified for that version; the channel stays usable.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use livebus_core::lifecycle::{Lifecycle, State};
use livebus_core::main_context::MainExecutor;
use tracing::debug;

use super::anchor;
use super::registration::{Observer, ObserverKey, Registration};
use super::remote::RemoteChannel;
use super::value::{Mailbox, NO_VALUE, VersionedValue};
use crate::error::ChannelError;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hooks fired when a channel gains its first or loses its last active
/// observer.
///
/// Useful to start or stop an upstream source only while someone listens.
/// Both methods default to no-ops.
pub trait ChannelActivity {
    /// Active observer count went from 0 to 1.
    fn on_active(&self) {}

    /// Active observer count went from 1 to 0. Inactive observers may remain.
    fn on_inactive(&self) {}
}

/// Main-context state of one channel.
pub(crate) struct ChannelCore<T> {
    pub(crate) id: ChannelId,
    pub(crate) label: Arc<str>,
    pub(crate) value: VersionedValue<T>,
    pub(crate) remote: RemoteChannel<T>,
    pub(crate) registrations: RefCell<Vec<Rc<Registration<T>>>>,
    next_seq: Cell<u64>,
    pub(crate) active_count: Cell<usize>,
    pub(crate) dispatching: Cell<bool>,
    pub(crate) dispatch_invalidated: Cell<bool>,
    pub(crate) hooks: RefCell<Option<Rc<dyn ChannelActivity>>>,
}

impl<T> Drop for ChannelCore<T> {
    fn drop(&mut self) {
        // Owners may outlive the channel.
        for registration in self.registrations.get_mut().drain(..) {
            registration.detach();
        }
        anchor::unregister(self.id);
    }
}

impl<T: Send + 'static> ChannelCore<T> {
    fn new(executor: Arc<dyn MainExecutor>, label: Arc<str>) -> Rc<Self> {
        let id = ChannelId::next();
        let remote = RemoteChannel::new(id, Arc::clone(&label), executor, Arc::new(Mailbox::new()));
        let core = Rc::new(Self {
            id,
            label,
            value: VersionedValue::new(),
            remote,
            registrations: RefCell::new(Vec::new()),
            next_seq: Cell::new(0),
            active_count: Cell::new(0),
            dispatching: Cell::new(false),
            dispatch_invalidated: Cell::new(false),
            hooks: RefCell::new(None),
        });
        anchor::register(&core);
        core
    }
}

impl<T: 'static> ChannelCore<T> {
    /// Apply `value` and broadcast it. Main context only.
    pub(crate) fn set_on_main_context(&self, value: T) {
        let version = self.value.set(value);
        tracing::trace!(channel = %self.label, version, "value set");
        self.dispatch(None);
    }

    fn next_seq(&self) -> u64 {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        seq
    }

    fn find(&self, key: ObserverKey) -> Option<Rc<Registration<T>>> {
        self.registrations
            .borrow()
            .iter()
            .find(|r| r.key == key)
            .cloned()
    }

    fn skip_for(&self, sticky: bool) -> bool {
        !sticky && self.value.version() > NO_VALUE
    }

    pub(crate) fn attach_owned(
        self: &Rc<Self>,
        owner: Rc<dyn Lifecycle>,
        key: ObserverKey,
        observer: Observer<T>,
        sticky: bool,
    ) -> Result<(), ChannelError> {
        if owner.current_state() == State::Destroyed {
            debug!(channel = %self.label, "owner already destroyed, observe ignored");
            return Ok(());
        }
        if let Some(existing) = self.find(key) {
            if existing.is_attached_to(&owner) {
                return Ok(());
            }
            return Err(ChannelError::OwnerConflict);
        }

        let registration = Registration::bound(
            self.next_seq(),
            key,
            observer,
            &owner,
            Rc::downgrade(self),
            self.skip_for(sticky),
        );
        self.registrations.borrow_mut().push(Rc::clone(&registration));
        if let Some(link) = registration.lifecycle_link() {
            owner.add_observer(link);
        }
        debug!(
            channel = %self.label,
            seq = registration.seq,
            sticky,
            state = %owner.current_state(),
            "observer attached to owner"
        );

        self.set_active(&registration, registration.should_be_active());
        Ok(())
    }

    pub(crate) fn attach_forever(
        &self,
        key: ObserverKey,
        observer: Observer<T>,
        sticky: bool,
    ) -> Result<(), ChannelError> {
        if let Some(existing) = self.find(key) {
            if existing.is_forever() {
                return Ok(());
            }
            return Err(ChannelError::OwnerConflict);
        }

        let registration =
            Registration::forever(self.next_seq(), key, observer, self.skip_for(sticky));
        self.registrations.borrow_mut().push(Rc::clone(&registration));
        debug!(channel = %self.label, seq = registration.seq, sticky, "observer attached forever");

        self.set_active(&registration, true);
        Ok(())
    }

    pub(crate) fn remove_key(&self, key: ObserverKey) -> bool {
        match self.find(key) {
            Some(registration) => {
                self.remove_registration(&registration);
                true
            }
            None => false,
        }
    }

    /// Drop `registration` from the channel: unhook it from its owner and
    /// mark it inactive. Safe to call mid-sweep.
    pub(crate) fn remove_registration(&self, registration: &Rc<Registration<T>>) {
        let removed = {
            let mut registrations = self.registrations.borrow_mut();
            match registrations.iter().position(|r| Rc::ptr_eq(r, registration)) {
                Some(index) => {
                    registrations.remove(index);
                    true
                }
                None => false,
            }
        };
        if !removed {
            return;
        }
        registration.detach();
        debug!(channel = %self.label, seq = registration.seq, "observer removed");
        self.set_active(registration, false);
    }
}

/// Handle to a channel, usable on the main context.
///
/// ```
/// use std::cell::RefCell;
/// use std::rc::Rc;
/// use std::sync::Arc;
/// use livebus_core::main_context::MainContext;
/// use livebus_runtime::{EventChannel, Observer};
///
/// let main = MainContext::new();
/// let channel = EventChannel::<String>::new(Arc::new(main), "greetings").unwrap();
///
/// let seen = Rc::new(RefCell::new(Vec::new()));
/// let sink = Rc::clone(&seen);
/// let observer = Observer::new(move |v: &String| sink.borrow_mut().push(v.clone()));
///
/// channel.post("early".to_string());
/// channel.observe_forever(&observer).unwrap(); // non-sticky: "early" is skipped
/// channel.post("hello".to_string());
///
/// assert_eq!(*seen.borrow(), vec!["hello".to_string()]);
/// ```
pub struct EventChannel<T> {
    core: Rc<ChannelCore<T>>,
}

impl<T> Clone for EventChannel<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T> fmt::Debug for EventChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("id", &self.core.id)
            .field("label", &self.core.label)
            .field("version", &self.core.value.version())
            .field("observer_count", &self.core.registrations.borrow().len())
            .field("active_count", &self.core.active_count.get())
            .finish()
    }
}

impl<T: Send + 'static> EventChannel<T> {
    /// Create a channel bound to `executor`'s main context.
    ///
    /// Must be called on the main context.
    pub fn new(
        executor: Arc<dyn MainExecutor>,
        label: impl Into<String>,
    ) -> Result<Self, ChannelError> {
        if !executor.is_main_thread() {
            return Err(ChannelError::OffMainContext {
                operation: "EventChannel::new",
            });
        }
        let label: Arc<str> = Arc::from(label.into());
        debug!(channel = %label, "channel created");
        Ok(Self {
            core: ChannelCore::new(executor, label),
        })
    }

    /// Process-unique identity of this channel.
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.core.id
    }

    /// Diagnostic label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.core.label
    }

    /// Send-able producer handle for this channel.
    #[must_use]
    pub fn remote(&self) -> RemoteChannel<T> {
        self.core.remote.clone()
    }

    /// Publish `value`.
    ///
    /// Applied and delivered before returning when called on the main
    /// context; otherwise routed through the coalescing mailbox.
    pub fn post(&self, value: T) {
        self.core.remote.post(value);
    }

    /// Publish `value` on the main context no earlier than `delay` from now.
    ///
    /// Delivered to whichever observers are active when it fires.
    pub fn post_delay(&self, value: T, delay: Duration) {
        self.core.remote.post_delay(value, delay);
    }

    /// Publish `value` through the main-context queue, preserving call order
    /// relative to other queued posts.
    pub fn post_orderly(&self, value: T) {
        self.core.remote.post_orderly(value);
    }

    /// Observe while `owner` is active, skipping any value posted before this
    /// call.
    ///
    /// Removed automatically when `owner` is destroyed. Ignored when `owner`
    /// is already destroyed.
    pub fn observe<L: Lifecycle + 'static>(
        &self,
        owner: &Rc<L>,
        observer: &Observer<T>,
    ) -> Result<(), ChannelError> {
        let owner: Rc<dyn Lifecycle> = Rc::clone(owner) as Rc<dyn Lifecycle>;
        self.core
            .attach_owned(owner, observer.key(), observer.clone(), false)
    }

    /// Like [`observe`](Self::observe), but the current value (if any) is
    /// delivered as soon as `owner` is active.
    pub fn observe_sticky<L: Lifecycle + 'static>(
        &self,
        owner: &Rc<L>,
        observer: &Observer<T>,
    ) -> Result<(), ChannelError> {
        let owner: Rc<dyn Lifecycle> = Rc::clone(owner) as Rc<dyn Lifecycle>;
        self.core
            .attach_owned(owner, observer.key(), observer.clone(), true)
    }

    /// Observe until [`remove_observer`](Self::remove_observer) is called,
    /// skipping any value posted before this call.
    pub fn observe_forever(&self, observer: &Observer<T>) -> Result<(), ChannelError> {
        self.core
            .attach_forever(observer.key(), observer.clone(), false)
    }

    /// Like [`observe_forever`](Self::observe_forever), but the current value
    /// (if any) is delivered immediately.
    pub fn observe_sticky_forever(&self, observer: &Observer<T>) -> Result<(), ChannelError> {
        self.core
            .attach_forever(observer.key(), observer.clone(), true)
    }

    /// Remove `observer`, whichever `observe*` call attached it.
    ///
    /// Returns whether it was registered. Safe to call from inside a
    /// delivery.
    pub fn remove_observer(&self, observer: &Observer<T>) -> bool {
        self.core.remove_key(observer.key())
    }

    /// Remove every observer bound to `owner`.
    pub fn remove_observers<L: Lifecycle + 'static>(&self, owner: &Rc<L>) -> usize {
        let owner: Rc<dyn Lifecycle> = Rc::clone(owner) as Rc<dyn Lifecycle>;
        let bound: Vec<_> = self
            .core
            .registrations
            .borrow()
            .iter()
            .filter(|r| r.is_attached_to(&owner))
            .cloned()
            .collect();
        for registration in &bound {
            self.core.remove_registration(registration);
        }
        bound.len()
    }

    /// Install hooks fired on the first-active and last-inactive edges.
    /// `None` restores the no-op default.
    pub fn set_activity_hooks(&self, hooks: Option<Rc<dyn ChannelActivity>>) {
        *self.core.hooks.borrow_mut() = hooks;
    }

    /// Current value, `None` if nothing was ever posted.
    #[must_use]
    pub fn value(&self) -> Option<Rc<T>> {
        self.core.value.current()
    }

    /// Current version, [`NO_VALUE`] if nothing was ever posted.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.core.value.version()
    }

    /// Whether any observer is registered, active or not.
    #[must_use]
    pub fn has_observers(&self) -> bool {
        !self.core.registrations.borrow().is_empty()
    }

    /// Whether any observer is currently active.
    #[must_use]
    pub fn has_active_observers(&self) -> bool {
        self.core.active_count.get() > 0
    }

    /// Number of registered observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.core.registrations.borrow().len()
    }
}
