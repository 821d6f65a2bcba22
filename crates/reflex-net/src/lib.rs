mod addr;
mod endpoint;
pub mod error;
mod reactor;
pub mod tcp;
mod udp;

pub use addr::{Address, Family};
pub use endpoint::SocketKind;
pub use error::{Error, Result};
pub use reactor::{EndpointRef, PumpMessage, Reactor, ReactorEvents, ReactorHandle};
pub use udp::{MAX_DATAGRAM, UdpEndpoint, UdpEvents};

/// Locks a mutex, shrugging off poisoning: the guarded state stays usable
/// even if a callback panicked while holding it.
pub(crate) fn lock_unpoisoned<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
