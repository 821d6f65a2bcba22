use std::{
    io,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU8, Ordering},
    },
};

use crate::{
    addr::{Address, Family},
    endpoint::{SocketCore, SocketKind},
    error::{AddressError, ListenerError, Result},
    lock_unpoisoned,
    reactor::{EndpointRef, ReactorHandle},
};

use super::TcpTalker;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::FromRepr)]
#[repr(u8)]
pub enum ListenState {
    Undefined,
    Listening,
}

/// Admission control and lifecycle callbacks for a [`TcpListener`].
///
/// `create_talker` runs once per accepted connection. Returning `None`
/// refuses the connection: the accepted handle is closed on the spot and no
/// further callback fires.
pub trait ListenerEvents: Send + Sync {
    fn create_talker(&self, reactor: &ReactorHandle) -> Option<Arc<TcpTalker>>;
    fn on_close(&self, _listener: &TcpListener) {}
    fn on_error(&self, _listener: &TcpListener) {}
}

/// Passive endpoint that accepts connections and hands each one to a
/// user-built [`TcpTalker`].
pub struct TcpListener {
    core: SocketCore,
    state: AtomicU8,
    local: Mutex<Address>,
    events: Box<dyn ListenerEvents>,
    weak_self: Weak<Self>,
}

impl TcpListener {
    pub fn new(reactor: &ReactorHandle, events: Box<dyn ListenerEvents>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            core: SocketCore::new(
                SocketKind::TcpListener,
                libc::SOCK_STREAM,
                libc::IPPROTO_TCP,
                reactor.downgrade(),
            ),
            state: AtomicU8::new(ListenState::Undefined as u8),
            local: Mutex::new(Address::default()),
            events,
            weak_self: weak.clone(),
        })
    }

    pub fn state(&self) -> ListenState {
        ListenState::from_repr(self.state.load(Ordering::Relaxed)).unwrap_or(ListenState::Undefined)
    }

    fn set_state(&self, state: ListenState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// The bound listening address, with the kernel-assigned port once
    /// `listen` has succeeded.
    pub fn local(&self) -> Address {
        *lock_unpoisoned(&self.local)
    }

    pub fn last_errno(&self) -> i32 {
        self.core.last_errno()
    }

    /// Binds `addr` and starts listening with the given backlog.
    pub fn listen(&self, addr: Address, backlog: i32) -> Result<()> {
        let family = match addr.family() {
            Family::V4 => libc::AF_INET,
            Family::V6 => libc::AF_INET6,
            Family::Undefined => return Err(AddressError::UndefinedFamily.into()),
        };
        *lock_unpoisoned(&self.local) = addr;

        self.core.open(family, self.endpoint_ref())?;

        let (storage, socklen) = addr.to_raw()?;
        let rc = unsafe {
            libc::bind(
                self.core.handle(),
                &storage as *const _ as *const libc::sockaddr,
                socklen,
            )
        };
        if rc < 0 {
            self.core.capture_errno();
            let err = ListenerError::UnableToBindSocket(io::Error::last_os_error());
            self.close();
            return Err(err.into());
        }

        if unsafe { libc::listen(self.core.handle(), backlog) } < 0 {
            self.core.capture_errno();
            return Err(ListenerError::UnableToListen(io::Error::last_os_error()).into());
        }

        *lock_unpoisoned(&self.local) = self.core.capture_local()?;
        self.set_state(ListenState::Listening);
        Ok(())
    }

    /// Listens on the IPv6 wildcard bound to `port`.
    pub fn listen_port(&self, port: u16, backlog: i32) -> Result<()> {
        self.listen(Address::any(port), backlog)
    }

    /// Stops listening: unregister, close the handle, fire `on_close`.
    pub fn close(&self) {
        self.core.disconnect();
        self.set_state(ListenState::Undefined);
        self.events.on_close(self);
    }

    pub(crate) fn events(&self) -> &dyn ListenerEvents {
        self.events.as_ref()
    }

    pub(crate) fn socket(&self) -> &SocketCore {
        &self.core
    }

    fn endpoint_ref(&self) -> EndpointRef {
        EndpointRef::Listener(
            self.weak_self.upgrade().expect("listener constructed outside an Arc"),
        )
    }
}
