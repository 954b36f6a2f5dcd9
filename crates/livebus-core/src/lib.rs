#![forbid(unsafe_code)]

//! Core: owner lifecycles and main-context marshalling.
//!
//! # Role in livebus
//! `livebus-core` holds the two collaborators the event engine depends on
//! but does not own:
//!
//! - **Lifecycle**: ordered owner states and synchronous transition
//!   notification ([`lifecycle::Lifecycle`], [`lifecycle::LifecycleRegistry`]).
//! - **Main context**: the single serialized context on which channel state
//!   is mutated, and the marshalling of work onto it from other threads
//!   ([`main_context::MainExecutor`], [`main_context::MainContext`]).
//!
//! # How it fits in the system
//! `livebus-runtime` builds event channels on top of these traits. Hosts
//! with their own event loop implement [`main_context::MainExecutor`] and
//! [`lifecycle::Lifecycle`] instead of using the bundled implementations.

pub mod lifecycle;
pub mod logging;
pub mod main_context;

// Re-export tracing macros at crate root for ergonomic use.
#[cfg(feature = "tracing")]
pub use logging::{
    debug, debug_span, error, error_span, info, info_span, trace, trace_span, warn, warn_span,
};

pub use lifecycle::{
    Lifecycle, LifecycleError, LifecycleEvent, LifecycleObserver, LifecycleRegistry, State,
};
pub use main_context::{ContextError, MainContext, MainContextConfig, MainExecutor, Task};
