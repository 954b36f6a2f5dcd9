#![forbid(unsafe_code)]

//! Keyed registry of channels.
//!
//! # Design
//!
//! [`EventBus`] is an explicit context object rather than a global: build it
//! once on the main context and pass it (or clones of the channels it hands
//! out) to the code that needs them. Channels are created lazily on first
//! lookup and live as long as the bus or any handle keeps them.
//!
//! A key is bound to one payload type for the lifetime of its entry.
//! [`EventBus::with`] keys by the payload's type name, so unrelated call
//! sites that agree on a type share a channel without agreeing on a string.
//!
//! # Failure Modes
//!
//! - Looking up a key with a payload type other than the one it was created
//!   with fails with [`BusError::TypeMismatch`]; the existing channel is
//!   untouched.

use std::any::{Any, type_name};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use livebus_core::main_context::MainExecutor;
use tracing::debug;

use crate::error::{BusError, ChannelError};
use crate::event::EventChannel;

struct Entry {
    /// An `EventChannel<T>` for the type named by `type_name`.
    channel: Box<dyn Any>,
    type_name: &'static str,
}

/// Main-context registry of channels by key.
pub struct EventBus {
    executor: Arc<dyn MainExecutor>,
    channels: RefCell<HashMap<String, Entry>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channels = self.channels.borrow();
        let mut keys: Vec<_> = channels.keys().map(String::as_str).collect();
        keys.sort_unstable();
        f.debug_struct("EventBus").field("channels", &keys).finish()
    }
}

impl EventBus {
    /// Create an empty bus. Must be called on the main context.
    pub fn new(executor: Arc<dyn MainExecutor>) -> Result<Self, ChannelError> {
        if !executor.is_main_thread() {
            return Err(ChannelError::OffMainContext {
                operation: "EventBus::new",
            });
        }
        Ok(Self {
            executor,
            channels: RefCell::new(HashMap::new()),
        })
    }

    /// Channel keyed by `T`'s type name.
    pub fn with<T: Send + 'static>(&self) -> Result<EventChannel<T>, BusError> {
        self.with_key(type_name::<T>())
    }

    /// Channel keyed by `key`, created on first use.
    pub fn with_key<T: Send + 'static>(&self, key: &str) -> Result<EventChannel<T>, BusError> {
        if let Some(entry) = self.channels.borrow().get(key) {
            return entry
                .channel
                .downcast_ref::<EventChannel<T>>()
                .cloned()
                .ok_or_else(|| BusError::TypeMismatch {
                    key: key.to_owned(),
                    expected: type_name::<T>(),
                    found: entry.type_name,
                });
        }

        let channel = EventChannel::<T>::new(Arc::clone(&self.executor), key)?;
        self.channels.borrow_mut().insert(
            key.to_owned(),
            Entry {
                channel: Box::new(channel.clone()),
                type_name: type_name::<T>(),
            },
        );
        debug!(key, payload = type_name::<T>(), "bus channel created");
        Ok(channel)
    }

    /// Whether a channel exists for `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.channels.borrow().contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.borrow().is_empty()
    }

    /// Forget the channel for `key`.
    ///
    /// Handles already handed out keep working; the next lookup of `key`
    /// creates a fresh channel, possibly of another payload type.
    pub fn remove(&self, key: &str) -> bool {
        // Dropping the entry may drop the channel; do it outside the borrow.
        let removed = self.channels.borrow_mut().remove(key);
        if removed.is_some() {
            debug!(key, "bus channel removed");
        }
        removed.is_some()
    }
}
