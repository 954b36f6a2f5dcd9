#![forbid(unsafe_code)]

//! Owner lifecycles that gate event delivery.
//!
//! A lifecycle owner is anything with a notion of "currently visible": a
//! screen, a session, a plugin instance. Subscribers bound to an owner only
//! receive events while the owner is [active](State::is_active), and are
//! dropped automatically once the owner reaches [`State::Destroyed`].
//!
//! # States
//!
//! ```text
//! Initialized ─► Created ─► Started ─► Resumed
//!                   ▲          ▲  │       │
//!                   │          │  └─Stop──┤
//!                   └──────────┴──Pause───┘
//!                              any ─► Destroyed (terminal)
//! ```
//!
//! # Invariants
//!
//! 1. `Destroyed` is terminal: no transition leaves it.
//! 2. Observers are notified synchronously, in registration order.
//! 3. An observer removed during a notification pass is not notified later
//!    in that same pass.
//! 4. Reaching `Destroyed` removes every observer.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Ordered lifecycle state of an owner.
///
/// The ordering is `Initialized < Created < Started < Resumed < Destroyed`.
/// Only `Started` and `Resumed` count as active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum State {
    /// Constructed but not yet created.
    #[default]
    Initialized,
    /// Created but not visible.
    Created,
    /// Visible.
    Started,
    /// Visible and focused.
    Resumed,
    /// Torn down. Terminal.
    Destroyed,
}

impl State {
    /// Whether observers bound to an owner in this state receive deliveries.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Started | Self::Resumed)
    }

    /// Whether `self` is at or beyond `other` in the state ordering.
    #[must_use]
    pub fn is_at_least(self, other: Self) -> bool {
        self >= other
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialized => "initialized",
            Self::Created => "created",
            Self::Started => "started",
            Self::Resumed => "resumed",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Transition requests understood by [`LifecycleRegistry::handle_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// Move to [`State::Created`].
    Create,
    /// Move to [`State::Started`].
    Start,
    /// Move to [`State::Resumed`].
    Resume,
    /// Leave the foreground: back to [`State::Started`].
    Pause,
    /// Leave the screen: back to [`State::Created`].
    Stop,
    /// Move to [`State::Destroyed`].
    Destroy,
}

impl LifecycleEvent {
    /// State the owner is in after this event is handled.
    #[must_use]
    pub const fn target_state(self) -> State {
        match self {
            Self::Create | Self::Stop => State::Created,
            Self::Start | Self::Pause => State::Started,
            Self::Resume => State::Resumed,
            Self::Destroy => State::Destroyed,
        }
    }
}

/// Errors from lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    /// The owner is destroyed and cannot move anywhere.
    AlreadyDestroyed,
    /// The requested transition is not allowed.
    InvalidTransition { from: State, to: State },
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyDestroyed => write!(f, "lifecycle is already destroyed"),
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid lifecycle transition from {from} to {to}")
            }
        }
    }
}

impl std::error::Error for LifecycleError {}

/// Receives every state transition of a [`Lifecycle`] it is added to.
pub trait LifecycleObserver {
    /// Called synchronously on the owner's thread after the state changed.
    fn on_state_changed(&self, state: State);
}

/// An owner whose state gates delivery.
///
/// Observers are compared by pointer identity: removing an observer requires
/// the same `Rc` allocation that was added.
pub trait Lifecycle {
    /// Current state of the owner.
    fn current_state(&self) -> State;

    /// Start notifying `observer` of transitions.
    ///
    /// Adding the same observer twice is a no-op.
    fn add_observer(&self, observer: Rc<dyn LifecycleObserver>);

    /// Stop notifying `observer`. Unknown observers are ignored.
    fn remove_observer(&self, observer: &Rc<dyn LifecycleObserver>);
}

/// Single-threaded [`Lifecycle`] driven by explicit transitions.
///
/// ```
/// use livebus_core::lifecycle::{Lifecycle, LifecycleEvent, LifecycleRegistry, State};
///
/// let owner = LifecycleRegistry::new();
/// owner.handle_event(LifecycleEvent::Create).unwrap();
/// owner.handle_event(LifecycleEvent::Start).unwrap();
/// assert_eq!(owner.current_state(), State::Started);
/// assert!(owner.current_state().is_active());
/// ```
pub struct LifecycleRegistry {
    state: Cell<State>,
    observers: RefCell<Vec<Rc<dyn LifecycleObserver>>>,
}

impl fmt::Debug for LifecycleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleRegistry")
            .field("state", &self.state.get())
            .field("observer_count", &self.observers.borrow().len())
            .finish()
    }
}

impl Default for LifecycleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleRegistry {
    /// Create a registry in [`State::Initialized`] with no observers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Cell::new(State::Initialized),
            observers: RefCell::new(Vec::new()),
        }
    }

    /// Create a registry already moved to `state`, without notifying anyone.
    #[must_use]
    pub fn in_state(state: State) -> Self {
        let registry = Self::new();
        registry.state.set(state);
        registry
    }

    /// Apply a [`LifecycleEvent`].
    pub fn handle_event(&self, event: LifecycleEvent) -> Result<(), LifecycleError> {
        self.set_state(event.target_state())
    }

    /// Move to `next` and notify observers.
    ///
    /// Setting the current state again is a no-op. Moving to
    /// [`State::Destroyed`] notifies observers once and then drops them all.
    pub fn set_state(&self, next: State) -> Result<(), LifecycleError> {
        let current = self.state.get();
        if current == State::Destroyed {
            return Err(LifecycleError::AlreadyDestroyed);
        }
        if next == current {
            return Ok(());
        }
        if next == State::Initialized {
            return Err(LifecycleError::InvalidTransition {
                from: current,
                to: next,
            });
        }

        self.state.set(next);
        #[cfg(feature = "tracing")]
        tracing::trace!(from = %current, to = %next, "lifecycle transition");

        // Observers may add or remove observers while being notified.
        let snapshot: Vec<Rc<dyn LifecycleObserver>> = self.observers.borrow().clone();
        for observer in &snapshot {
            if !self.contains(observer) {
                continue;
            }
            observer.on_state_changed(next);
        }

        if next == State::Destroyed {
            self.observers.borrow_mut().clear();
        }
        Ok(())
    }

    /// Number of observers currently registered.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.borrow().len()
    }

    fn contains(&self, observer: &Rc<dyn LifecycleObserver>) -> bool {
        self.observers
            .borrow()
            .iter()
            .any(|o| same_observer(o, observer))
    }
}

impl Lifecycle for LifecycleRegistry {
    fn current_state(&self) -> State {
        self.state.get()
    }

    fn add_observer(&self, observer: Rc<dyn LifecycleObserver>) {
        if self.state.get() == State::Destroyed || self.contains(&observer) {
            return;
        }
        self.observers.borrow_mut().push(observer);
    }

    fn remove_observer(&self, observer: &Rc<dyn LifecycleObserver>) {
        self.observers
            .borrow_mut()
            .retain(|o| !same_observer(o, observer));
    }
}

fn same_observer(a: &Rc<dyn LifecycleObserver>, b: &Rc<dyn LifecycleObserver>) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}
