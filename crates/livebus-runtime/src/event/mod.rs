#![forbid(unsafe_code)]

//! The event engine: versioned values, observer registrations, the dispatch
//! loop and the channel handles built on them.

pub mod channel;
pub mod registration;
pub mod remote;
pub mod value;

mod anchor;
mod dispatch;

pub use channel::{ChannelActivity, ChannelId, EventChannel};
pub use registration::{Observer, ObserverKey, SyncObserver};
pub use remote::RemoteChannel;
pub use value::{NO_VALUE, VersionedValue};
