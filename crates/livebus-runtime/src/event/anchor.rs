#![forbid(unsafe_code)]

//! Main-thread lookup table from [`ChannelId`] to channel state.
//!
//! Channel state is `!Send`, so tasks marshalled from other threads cannot
//! carry it. They carry the channel id instead and resolve it here once they
//! run on the main context. Entries are weak: a channel that has been dropped
//! resolves to `None` and the task is discarded.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use super::channel::{ChannelCore, ChannelId};

thread_local! {
    /// Channels created on this thread.
    static ANCHORS: RefCell<HashMap<ChannelId, Weak<dyn Any>>> = RefCell::new(HashMap::new());
}

pub(crate) fn register<T: 'static>(core: &Rc<ChannelCore<T>>) {
    let any: Rc<dyn Any> = Rc::clone(core) as Rc<dyn Any>;
    let weak = Rc::downgrade(&any);
    ANCHORS.with(|anchors| {
        anchors.borrow_mut().insert(core.id, weak);
    });
}

pub(crate) fn unregister(id: ChannelId) {
    // The table may already be gone during thread teardown.
    let _ = ANCHORS.try_with(|anchors| {
        if let Ok(mut anchors) = anchors.try_borrow_mut() {
            anchors.remove(&id);
        }
    });
}

/// Channel state for `id`, if it was created on this thread, is still alive
/// and carries payload type `T`.
pub(crate) fn resolve<T: 'static>(id: ChannelId) -> Option<Rc<ChannelCore<T>>> {
    let any = ANCHORS
        .try_with(|anchors| anchors.borrow().get(&id).and_then(Weak::upgrade))
        .ok()
        .flatten()?;
    any.downcast::<ChannelCore<T>>().ok()
}
