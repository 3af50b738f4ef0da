//! Traits and types related to events
//!
//! Things that happen on the core, e.g. a GPU being hot-plugged or a monitor
//! being connected, are delivered in two ways. Synchronous callbacks can be
//! registered through a [`listeners::Listeners`] registry, they are invoked
//! from [`Core::dispatch`](crate::core::Core::dispatch) on the thread that
//! calls it. Alternatively, anything that implements [`EventSource`] hands out
//! a stream of the same events, which is convenient for async embedders.

/// Event source
///
/// An event source is something you can get a stream of events from.
pub trait EventSource<Event> {
    /// Type of event stream you get from this event source.
    type Source: futures_util::stream::Stream<Item = Event> + 'static;

    /// Get a stream of events from the event source.
    fn subscribe(&self) -> Self::Source;
}

pub mod broadcast;
pub mod listeners;

use std::sync::Arc;

use crate::{connector::Connector, device::Device};

/// Events emitted by the core
#[derive(Clone, Debug)]
pub enum CoreEvent {
    /// A new GPU was found and opened
    DeviceCreated(Arc<Device>),
    /// A GPU was removed. Its connectors have already been uninitialized.
    DeviceRemoved(Arc<Device>),
    /// A display was connected
    ConnectorPlugged(Arc<Connector>),
    /// A display was disconnected
    ConnectorUnplugged(Arc<Connector>),
}
