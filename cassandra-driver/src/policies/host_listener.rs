//! Host listeners can subscribe to events regarding hosts.
//!
//! This includes events when a host is found in or lost from the cluster,
//! as well as when a host is marked as up or down.

use crate::cluster::Host;

/// Kind of host event being signalled by [HostListener].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// Signalled when the driver learns that a new host is part of the cluster.
    ///
    /// This happens when the control connection discovers a new peer,
    /// or when a known address turns out to belong to a different host.
    Found,

    /// Signalled when the driver learns that a known host is removed from the cluster.
    Lost,

    /// Signalled when a host becomes reachable.
    Up,

    /// Signalled when a host becomes unreachable.
    Down,
}

/// A listener that can be registered in the [`Registry`](crate::cluster::Registry)
/// to receive events regarding hosts.
///
/// Callbacks run synchronously on the thread that changed the registry, after
/// the change is published. Listeners that need to do I/O should spawn a task.
/// A panicking listener does not affect other listeners.
pub trait HostListener: Send + Sync {
    fn on_event(&self, host: &Host, event: HostEvent);
}
