#![forbid(unsafe_code)]

//! Keyed envelopes routed into bus channels.
//!
//! An [`Envelope`] is an opaque byte payload plus a routing key, as handed
//! over by some transport the bus does not know about. [`route`] posts it on
//! the [`Envelope`] channel named by its key, so subscribers observe
//! `bus.with_key::<Envelope>(key)`.

use std::any::type_name;

use crate::bus::EventBus;
use crate::error::EnvelopeError;

/// Opaque payload with a routing key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Envelope routed to `key`.
    pub fn keyed(key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key: Some(key.into()),
            payload: payload.into(),
        }
    }

    /// Envelope routed to the channel named after payload type `P`.
    pub fn typed<P: ?Sized>(payload: impl Into<Vec<u8>>) -> Self {
        Self::keyed(type_name::<P>(), payload)
    }

    /// Routing key, if present and non-empty.
    #[must_use]
    pub fn route_key(&self) -> Option<&str> {
        self.key.as_deref().filter(|key| !key.is_empty())
    }
}

/// Post `envelope` on `bus.with_key::<Envelope>(key)`.
///
/// Delivery follows the channel's usual rules: synchronous on the main
/// context, to currently active observers.
pub fn route(bus: &EventBus, envelope: Envelope) -> Result<(), EnvelopeError> {
    let key = envelope.route_key().ok_or(EnvelopeError::EmptyKey)?.to_owned();
    let channel = bus.with_key::<Envelope>(&key)?;
    tracing::trace!(key = %key, bytes = envelope.payload.len(), "routing envelope");
    channel.post(envelope);
    Ok(())
}
