#![forbid(unsafe_code)]

//! Thread-safe producer handle for a channel.
//!
//! [`RemoteChannel<T>`] can be cloned and moved to any thread. Every call is
//! either applied at once (when already on the main context) or marshalled
//! onto the main context as a task.
//!
//! # Posting from other threads
//!
//! - `post` goes through the channel's single-slot mailbox. Only the first
//!   post into an empty mailbox schedules a drain; posts that arrive before
//!   the drain runs replace the queued value. Intermediate values are lost
//!   by design: the observer sees the latest one.
//! - `post_orderly` and `post_delay` queue one task per call and never drop
//!   values.
//! - A background `post` followed by a main-context `post` may apply in the
//!   opposite order: the main-context value is applied at once, the
//!   mailbox value when its drain runs.
//!
//! # Subscription management
//!
//! `observe_forever`, `observe_sticky_forever` and `remove_observer` accept
//! [`SyncObserver`]s. Requests made off the main context are queued as
//! independent tasks (they never coalesce); errors they hit on the main
//! context are logged because no caller is left to receive them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use livebus_core::main_context::MainExecutor;
use tracing::{error, trace};

use super::anchor;
use super::channel::{ChannelCore, ChannelId};
use super::registration::SyncObserver;
use super::value::Mailbox;
use crate::error::ChannelError;

/// `Send + Sync` handle for posting to (and managing forever-observers of)
/// a channel from any thread.
pub struct RemoteChannel<T> {
    id: ChannelId,
    label: Arc<str>,
    executor: Arc<dyn MainExecutor>,
    mailbox: Arc<Mailbox<T>>,
}

impl<T> Clone for RemoteChannel<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            label: Arc::clone(&self.label),
            executor: Arc::clone(&self.executor),
            mailbox: Arc::clone(&self.mailbox),
        }
    }
}

impl<T> fmt::Debug for RemoteChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteChannel")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("mailbox_occupied", &self.mailbox.is_occupied())
            .finish()
    }
}

impl<T: Send + 'static> RemoteChannel<T> {
    pub(crate) fn new(
        id: ChannelId,
        label: Arc<str>,
        executor: Arc<dyn MainExecutor>,
        mailbox: Arc<Mailbox<T>>,
    ) -> Self {
        Self {
            id,
            label,
            executor,
            mailbox,
        }
    }

    /// Identity of the target channel.
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Diagnostic label of the target channel.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the calling thread is the channel's main context.
    #[must_use]
    pub fn is_main_thread(&self) -> bool {
        self.executor.is_main_thread()
    }

    /// Publish `value`: applied at once on the main context, otherwise
    /// through the coalescing mailbox (last write wins).
    pub fn post(&self, value: T) {
        if self.executor.is_main_thread() {
            apply(self.id, &self.label, value);
            return;
        }
        self.post_value(value);
    }

    /// Stage `value` in the mailbox and schedule a drain unless one is
    /// already pending. Callable from any thread.
    pub fn post_value(&self, value: T) {
        if !self.mailbox.offer(value) {
            trace!(channel = %self.label, "post coalesced into pending value");
            return;
        }
        let id = self.id;
        let label = Arc::clone(&self.label);
        let mailbox = Arc::clone(&self.mailbox);
        self.executor.run_async(Box::new(move || {
            if let Some(value) = mailbox.take() {
                apply(id, &label, value);
            }
        }));
    }

    /// Publish `value` on the main context no earlier than `delay` from now.
    pub fn post_delay(&self, value: T, delay: Duration) {
        let id = self.id;
        let label = Arc::clone(&self.label);
        self.executor
            .run_async_after(Box::new(move || apply(id, &label, value)), delay);
    }

    /// Publish `value` through the main-context queue, in call order with
    /// other queued work.
    pub fn post_orderly(&self, value: T) {
        let id = self.id;
        let label = Arc::clone(&self.label);
        self.executor
            .run_async(Box::new(move || apply(id, &label, value)));
    }

    /// Observe until removed, skipping any value posted before the
    /// registration takes effect.
    ///
    /// Errors are returned on the main context and logged elsewhere.
    pub fn observe_forever(&self, observer: &SyncObserver<T>) -> Result<(), ChannelError> {
        self.attach_forever(observer, false)
    }

    /// Observe until removed, receiving the current value first.
    pub fn observe_sticky_forever(&self, observer: &SyncObserver<T>) -> Result<(), ChannelError> {
        self.attach_forever(observer, true)
    }

    /// Remove `observer`. Off the main context this is queued and always
    /// reports `true`.
    pub fn remove_observer(&self, observer: &SyncObserver<T>) -> bool {
        if self.executor.is_main_thread() {
            return self
                .resolve()
                .is_some_and(|core| core.remove_key(observer.key()));
        }
        let id = self.id;
        let label = Arc::clone(&self.label);
        // Holding the observer keeps its address, and so its key, unique
        // until the removal runs.
        let observer = observer.clone();
        self.executor.run_async(Box::new(move || {
            match anchor::resolve::<T>(id) {
                Some(core) => {
                    core.remove_key(observer.key());
                }
                None => trace!(channel = %label, "channel gone, remove dropped"),
            }
        }));
        true
    }

    fn attach_forever(&self, observer: &SyncObserver<T>, sticky: bool) -> Result<(), ChannelError> {
        if self.executor.is_main_thread() {
            let Some(core) = self.resolve() else {
                return Ok(());
            };
            let (key, local) = observer.to_local();
            return core.attach_forever(key, local, sticky);
        }
        let id = self.id;
        let label = Arc::clone(&self.label);
        let observer = observer.clone();
        self.executor.run_async(Box::new(move || {
            let Some(core) = anchor::resolve::<T>(id) else {
                trace!(channel = %label, "channel gone, observe dropped");
                return;
            };
            let (key, local) = observer.to_local();
            if let Err(err) = core.attach_forever(key, local, sticky) {
                error!(channel = %label, %err, "marshalled observe failed");
            }
        }));
        Ok(())
    }

    fn resolve(&self) -> Option<std::rc::Rc<ChannelCore<T>>> {
        anchor::resolve::<T>(self.id)
    }
}

/// Apply `value` to channel `id`. Main context only.
fn apply<T: Send + 'static>(id: ChannelId, label: &str, value: T) {
    match anchor::resolve::<T>(id) {
        Some(core) => core.set_on_main_context(value),
        None => trace!(channel = %label, "channel gone, value dropped"),
    }
}
