#![forbid(unsafe_code)]

//! Error types for channels, the bus and envelope routing.

use std::fmt;

/// Errors from subscription and construction on an [`EventChannel`].
///
/// [`EventChannel`]: crate::EventChannel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The observer is already registered with a different owner (or with
    /// an owner where a forever registration was requested, or vice versa).
    OwnerConflict,
    /// The operation requires the main context.
    OffMainContext { operation: &'static str },
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OwnerConflict => {
                write!(f, "observer is already attached with a different owner")
            }
            Self::OffMainContext { operation } => {
                write!(f, "{operation} must be called on the main context")
            }
        }
    }
}

impl std::error::Error for ChannelError {}

/// Errors from [`EventBus`](crate::EventBus) lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The key is already bound to a channel of another payload type.
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    Channel(ChannelError),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeMismatch {
                key,
                expected,
                found,
            } => write!(
                f,
                "channel '{key}' carries {found}, requested as {expected}"
            ),
            Self::Channel(err) => write!(f, "channel error: {err}"),
        }
    }
}

impl std::error::Error for BusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Channel(err) => Some(err),
            Self::TypeMismatch { .. } => None,
        }
    }
}

impl From<ChannelError> for BusError {
    fn from(err: ChannelError) -> Self {
        Self::Channel(err)
    }
}

/// Errors from [`route`](crate::envelope::route).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The envelope has no key, or an empty one.
    EmptyKey,
    Bus(BusError),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyKey => write!(f, "envelope has no routing key"),
            Self::Bus(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for EnvelopeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bus(err) => Some(err),
            Self::EmptyKey => None,
        }
    }
}

impl From<BusError> for EnvelopeError {
    fn from(err: BusError) -> Self {
        Self::Bus(err)
    }
}

impl From<ChannelError> for EnvelopeError {
    fn from(err: ChannelError) -> Self {
        Self::Bus(BusError::Channel(err))
    }
}
