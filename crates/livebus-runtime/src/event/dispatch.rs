#![forbid(unsafe_code)]

//! Re-entrancy-safe delivery loop.
//!
//! # Algorithm
//!
//! A dispatch either targets one registration (the *initiator*, used when a
//! registration just became active) or sweeps all registrations in insertion
//! order. A dispatch requested while another is running does not recurse:
//! it marks the running one invalidated and returns. The running loop then
//! abandons its current sweep and restarts with a full sweep.
//!
//! ```text
//! dispatch(initiator)
//!   ├─ already dispatching? ── mark invalidated, return
//!   └─ loop
//!        clear invalidated
//!        initiator? consider(initiator) : for reg in regs { consider(reg); break if invalidated }
//!      while invalidated
//! ```
//!
//! Stack depth stays bounded however many posts observers make from inside
//! callbacks. The price: when an observer posts during a sweep, observers
//! not yet visited only see the newest value (intermediate values coalesce).
//!
//! # Sweep cursor
//!
//! Sweeps walk by insertion sequence rather than by index, re-reading the
//! registration list after every callback. Registrations added mid-sweep are
//! visited in the same sweep; registrations removed mid-sweep are never
//! visited again and never cause others to be skipped.

use std::cell::Cell;
use std::rc::Rc;

use tracing::{debug, trace};

use super::channel::ChannelCore;
use super::registration::Registration;

/// Clears the dispatching flag even when an observer panics.
struct DispatchGuard<'a> {
    dispatching: &'a Cell<bool>,
}

impl<'a> DispatchGuard<'a> {
    fn enter(dispatching: &'a Cell<bool>) -> Self {
        dispatching.set(true);
        Self { dispatching }
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.dispatching.set(false);
    }
}

impl<T: 'static> ChannelCore<T> {
    /// Deliver the current version to `initiator`, or to every registration
    /// when `None`.
    pub(crate) fn dispatch(&self, initiator: Option<Rc<Registration<T>>>) {
        if self.dispatching.get() {
            self.dispatch_invalidated.set(true);
            trace!(channel = %self.label, "dispatch requested mid-dispatch, restarting");
            return;
        }
        let _guard = DispatchGuard::enter(&self.dispatching);

        let mut initiator = initiator;
        loop {
            self.dispatch_invalidated.set(false);
            match initiator.take() {
                Some(registration) => self.consider_notify(&registration),
                None => self.sweep(),
            }
            if !self.dispatch_invalidated.get() {
                break;
            }
        }
    }

    fn sweep(&self) {
        let mut cursor = None;
        while let Some(registration) = self.next_after(cursor) {
            cursor = Some(registration.seq);
            self.consider_notify(&registration);
            if self.dispatch_invalidated.get() {
                break;
            }
        }
    }

    /// First registration inserted after `cursor` that is still attached.
    fn next_after(&self, cursor: Option<u64>) -> Option<Rc<Registration<T>>> {
        let registrations = self.registrations.borrow();
        let start = match cursor {
            Some(seq) => registrations.partition_point(|r| r.seq <= seq),
            None => 0,
        };
        registrations.get(start).cloned()
    }

    /// Deliver the current value to `registration` if it is active and
    /// behind.
    pub(crate) fn consider_notify(&self, registration: &Rc<Registration<T>>) {
        if !registration.active.get() {
            return;
        }
        // Only a state-change event may activate a registration; a stale
        // active flag is corrected here and delivery waits for that event.
        if !registration.should_be_active() {
            self.set_active(registration, false);
            return;
        }
        let version = self.value.version();
        if registration.last_version.get() >= version {
            return;
        }
        registration.last_version.set(version);

        let Some(value) = self.value.current() else {
            return;
        };
        if registration.skip_next.replace(false) {
            trace!(channel = %self.label, seq = registration.seq, version, "delivery suppressed");
            return;
        }
        trace!(channel = %self.label, seq = registration.seq, version, "delivering");
        registration.observer.notify(&value);
    }

    /// Flip `registration`'s active flag, maintaining the active count and
    /// firing activity hooks on the 0↔1 edges. A registration that becomes
    /// active is immediately offered the current value.
    pub(crate) fn set_active(&self, registration: &Rc<Registration<T>>, active: bool) {
        if registration.active.get() == active {
            return;
        }
        if active && registration.detached.get() {
            return;
        }
        registration.active.set(active);

        let was_idle = self.active_count.get() == 0;
        let count = if active {
            self.active_count.get() + 1
        } else {
            self.active_count.get().saturating_sub(1)
        };
        self.active_count.set(count);

        if was_idle && active {
            debug!(channel = %self.label, "channel became active");
            if let Some(hooks) = self.activity_hooks() {
                hooks.on_active();
            }
        }
        if count == 0 && !active {
            debug!(channel = %self.label, "channel became inactive");
            if let Some(hooks) = self.activity_hooks() {
                hooks.on_inactive();
            }
        }

        if active {
            self.dispatch(Some(Rc::clone(registration)));
        }
    }

    fn activity_hooks(&self) -> Option<Rc<dyn super::channel::ChannelActivity>> {
        self.hooks.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::rc::Rc;
    use std::sync::Arc;

    use livebus_core::main_context::MainContext;

    use crate::event::{EventChannel, Observer};

    fn channel<T: Send + 'static>() -> EventChannel<T> {
        EventChannel::new(Arc::new(MainContext::new()), "dispatch").unwrap()
    }

    #[test]
    fn delivers_in_registration_order() {
        let channel = channel::<u8>();
        let log = Rc::new(RefCell::new(Vec::new()));
        let observers: Vec<_> = ['A', 'B', 'C']
            .into_iter()
            .map(|tag| {
                let log = Rc::clone(&log);
                Observer::new(move |_: &u8| log.borrow_mut().push(tag))
            })
            .collect();
        for observer in &observers {
            channel.observe_forever(observer).unwrap();
        }

        channel.post(1);
        assert_eq!(*log.borrow(), vec!['A', 'B', 'C']);
    }

    #[test]
    fn nested_post_restarts_instead_of_recursing() {
        let channel = channel::<u32>();
        let log = Rc::new(RefCell::new(Vec::new()));

        // First observer re-posts until the value reaches 3.
        let reposter = {
            let channel = channel.clone();
            let log = Rc::clone(&log);
            Observer::new(move |v: &u32| {
                log.borrow_mut().push(("first", *v));
                if *v < 3 {
                    channel.post(*v + 1);
                }
            })
        };
        let second = {
            let log = Rc::clone(&log);
            Observer::new(move |v: &u32| log.borrow_mut().push(("second", *v)))
        };
        channel.observe_forever(&reposter).unwrap();
        channel.observe_forever(&second).unwrap();

        channel.post(0);

        // The second observer never sees the intermediate values.
        assert_eq!(
            *log.borrow(),
            vec![
                ("first", 0),
                ("first", 1),
                ("first", 2),
                ("first", 3),
                ("second", 3)
            ]
        );
        assert_eq!(channel.version(), 3);
    }

    #[test]
    fn deep_reentrancy_keeps_stack_flat() {
        let channel = channel::<u32>();
        let last = Rc::new(RefCell::new(0));
        let observer = {
            let channel = channel.clone();
            let last = Rc::clone(&last);
            Observer::new(move |v: &u32| {
                *last.borrow_mut() = *v;
                if *v < 100_000 {
                    channel.post(*v + 1);
                }
            })
        };
        channel.observe_forever(&observer).unwrap();
        channel.post(0);
        assert_eq!(*last.borrow(), 100_000);
    }

    #[test]
    fn removal_mid_sweep_does_not_skip_others() {
        let channel = channel::<u8>();
        let log = Rc::new(RefCell::new(Vec::new()));

        let victim = {
            let log = Rc::clone(&log);
            Observer::new(move |_: &u8| log.borrow_mut().push("victim"))
        };
        let remover = {
            let channel = channel.clone();
            let victim = victim.clone();
            let log = Rc::clone(&log);
            Observer::new(move |_: &u8| {
                log.borrow_mut().push("remover");
                channel.remove_observer(&victim);
            })
        };
        let tail = {
            let log = Rc::clone(&log);
            Observer::new(move |_: &u8| log.borrow_mut().push("tail"))
        };

        channel.observe_forever(&remover).unwrap();
        channel.observe_forever(&victim).unwrap();
        channel.observe_forever(&tail).unwrap();

        channel.post(1);
        assert_eq!(*log.borrow(), vec!["remover", "tail"]);

        channel.post(2);
        assert_eq!(*log.borrow(), vec!["remover", "tail", "remover", "tail"]);
    }

    #[test]
    fn self_removal_inside_callback() {
        let channel = channel::<u8>();
        let hits = Rc::new(RefCell::new(0));
        let slot: Rc<RefCell<Option<Observer<u8>>>> = Rc::new(RefCell::new(None));
        let observer = {
            let channel = channel.clone();
            let hits = Rc::clone(&hits);
            let slot = Rc::clone(&slot);
            Observer::new(move |_: &u8| {
                *hits.borrow_mut() += 1;
                if let Some(me) = slot.borrow().as_ref() {
                    channel.remove_observer(me);
                }
            })
        };
        *slot.borrow_mut() = Some(observer.clone());
        channel.observe_forever(&observer).unwrap();

        channel.post(1);
        channel.post(2);
        assert_eq!(*hits.borrow(), 1);
        assert!(!channel.has_observers());
        // Break the observer -> slot -> observer cycle.
        slot.borrow_mut().take();
    }

    #[test]
    fn observer_added_mid_sweep_is_visited() {
        let channel = channel::<u8>();
        let log = Rc::new(RefCell::new(Vec::new()));
        let late = {
            let log = Rc::clone(&log);
            Observer::new(move |v: &u8| log.borrow_mut().push(("late", *v)))
        };
        let adder = {
            let channel = channel.clone();
            let late = late.clone();
            let log = Rc::clone(&log);
            Observer::new(move |v: &u8| {
                log.borrow_mut().push(("adder", *v));
                channel.observe_sticky_forever(&late).unwrap();
            })
        };
        channel.observe_forever(&adder).unwrap();

        channel.post(1);
        // Activation mid-sweep defers to the restarted sweep, which delivers once.
        assert_eq!(*log.borrow(), vec![("adder", 1), ("late", 1)]);
    }

    #[test]
    fn panicking_observer_leaves_channel_usable() {
        let channel = channel::<u8>();
        let log = Rc::new(RefCell::new(Vec::new()));
        let bomb = Observer::new(|v: &u8| {
            if *v == 1 {
                panic!("observer failure");
            }
        });
        let after = {
            let log = Rc::clone(&log);
            Observer::new(move |v: &u8| log.borrow_mut().push(*v))
        };
        channel.observe_forever(&bomb).unwrap();
        channel.observe_forever(&after).unwrap();

        let result = catch_unwind(AssertUnwindSafe(|| channel.post(1)));
        assert!(result.is_err());
        // The rest of that sweep was abandoned.
        assert!(log.borrow().is_empty());

        channel.post(2);
        assert_eq!(*log.borrow(), vec![2]);
    }
}
