//! Property-based invariant tests for the lifecycle registry.
//!
//! 1. `handle_event` succeeds exactly until the owner is destroyed, and a
//!    successful event leaves the owner in the event's target state.
//! 2. `Destroyed` is terminal: every later event fails and the state stays.
//! 3. Observers are notified once per real transition (re-entering the
//!    current state is silent), with the new state, in registration order.
//! 4. Reaching `Destroyed` drops every observer.

use std::cell::RefCell;
use std::rc::Rc;

use livebus_core::lifecycle::{
    Lifecycle, LifecycleError, LifecycleEvent, LifecycleObserver, LifecycleRegistry, State,
};
use proptest::prelude::*;

// ── Strategies ────────────────────────────────────────────────────────────

fn event_strategy() -> impl Strategy<Value = LifecycleEvent> {
    prop_oneof![
        3 => Just(LifecycleEvent::Create),
        3 => Just(LifecycleEvent::Start),
        3 => Just(LifecycleEvent::Resume),
        3 => Just(LifecycleEvent::Pause),
        3 => Just(LifecycleEvent::Stop),
        1 => Just(LifecycleEvent::Destroy),
    ]
}

fn events_strategy(max_len: usize) -> impl Strategy<Value = Vec<LifecycleEvent>> {
    proptest::collection::vec(event_strategy(), 0..=max_len)
}

/// Appends `(tag, state)` to a shared log on every notification.
struct Tagged {
    tag: usize,
    log: Rc<RefCell<Vec<(usize, State)>>>,
}

impl LifecycleObserver for Tagged {
    fn on_state_changed(&self, state: State) {
        self.log.borrow_mut().push((self.tag, state));
    }
}

// 1 + 2. Success until destroyed, terminal afterwards

proptest! {
    #[test]
    fn destroyed_is_terminal(events in events_strategy(64)) {
        let owner = LifecycleRegistry::new();
        let mut destroyed = false;
        for event in events {
            let result = owner.handle_event(event);
            if destroyed {
                prop_assert_eq!(result, Err(LifecycleError::AlreadyDestroyed));
                prop_assert_eq!(owner.current_state(), State::Destroyed);
            } else {
                prop_assert!(result.is_ok(), "{:?} failed before destroy", event);
                prop_assert_eq!(owner.current_state(), event.target_state());
                destroyed = event == LifecycleEvent::Destroy;
            }
        }
    }
}

// 3 + 4. One notification per real transition, observers dropped at the end

proptest! {
    #[test]
    fn observers_see_each_real_transition_once(
        observers in 1usize..5,
        events in events_strategy(48),
    ) {
        let owner = LifecycleRegistry::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for tag in 0..observers {
            owner.add_observer(Rc::new(Tagged {
                tag,
                log: Rc::clone(&log),
            }));
        }

        let mut expected = Vec::new();
        let mut state = owner.current_state();
        for event in events {
            if state == State::Destroyed {
                prop_assert!(owner.handle_event(event).is_err());
                continue;
            }
            owner.handle_event(event).unwrap();
            let next = event.target_state();
            if next != state {
                expected.extend((0..observers).map(|tag| (tag, next)));
            }
            state = next;
        }

        prop_assert_eq!(&*log.borrow(), &expected);
        if state == State::Destroyed {
            prop_assert_eq!(owner.observer_count(), 0);
        } else {
            prop_assert_eq!(owner.observer_count(), observers);
        }
    }
}
