#![forbid(unsafe_code)]

//! Lifecycle-aware event channels.
//!
//! # Role in livebus
//! `livebus-runtime` is the dispatch engine. An [`EventChannel<T>`] retains
//! the latest value posted to it and delivers each new value, at most once,
//! to every observer that is active: forever-observers always, owner-bound
//! observers while their [`Lifecycle`] owner is started or resumed.
//!
//! # How it fits in the system
//! - `livebus-core` provides the [`Lifecycle`] owners and the
//!   [`MainExecutor`] every channel is bound to.
//! - [`event`] holds the engine: versioned values, registrations, the
//!   re-entrancy-safe dispatch loop and the channel handles.
//! - [`bus`] and [`envelope`] are thin lookup and routing surfaces on top.
//!
//! All channel state lives on the main context. Other threads publish
//! through [`RemoteChannel<T>`].
//!
//! [`Lifecycle`]: livebus_core::lifecycle::Lifecycle
//! [`MainExecutor`]: livebus_core::main_context::MainExecutor

pub mod bus;
pub mod envelope;
pub mod error;
pub mod event;

pub use bus::EventBus;
pub use envelope::{Envelope, route};
pub use error::{BusError, ChannelError, EnvelopeError};
pub use event::{
    ChannelActivity, ChannelId, EventChannel, NO_VALUE, Observer, ObserverKey, RemoteChannel,
    SyncObserver, VersionedValue,
};
