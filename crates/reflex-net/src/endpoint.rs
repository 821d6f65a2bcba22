use std::{
    io, mem,
    os::fd::RawFd,
    sync::{
        Weak,
        atomic::{AtomicI32, Ordering},
    },
};

use tracing::warn;

use crate::{
    addr::Address,
    error::{PipeError, Result, SocketError},
    reactor::{EndpointRef, ReactorCore},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[repr(u8)]
pub enum SocketKind {
    TcpTalker,
    TcpListener,
    Udp,
}

pub(crate) const INVALID_HANDLE: RawFd = -1;

/// Shared plumbing for every socket endpoint: the non-blocking OS handle,
/// the captured errno, and the back-reference used to register with the
/// owning reactor.
pub(crate) struct SocketCore {
    kind: SocketKind,
    ty: libc::c_int,
    protocol: libc::c_int,
    handle: AtomicI32,
    last_errno: AtomicI32,
    reactor: Weak<ReactorCore>,
}

impl SocketCore {
    pub(crate) fn new(
        kind: SocketKind,
        ty: libc::c_int,
        protocol: libc::c_int,
        reactor: Weak<ReactorCore>,
    ) -> Self {
        Self {
            kind,
            ty,
            protocol,
            handle: AtomicI32::new(INVALID_HANDLE),
            last_errno: AtomicI32::new(0),
            reactor,
        }
    }

    pub(crate) fn kind(&self) -> SocketKind {
        self.kind
    }

    pub(crate) fn handle(&self) -> RawFd {
        self.handle.load(Ordering::Relaxed)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.handle() != INVALID_HANDLE
    }

    /// Stores the calling thread's last OS error on the endpoint and
    /// returns it.
    pub(crate) fn capture_errno(&self) -> i32 {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        self.last_errno.store(errno, Ordering::Relaxed);
        errno
    }

    pub(crate) fn set_errno(&self, errno: i32) {
        self.last_errno.store(errno, Ordering::Relaxed);
    }

    pub(crate) fn last_errno(&self) -> i32 {
        self.last_errno.load(Ordering::Relaxed)
    }

    /// Creates the kernel socket, applies the endpoint options and registers
    /// with the reactor.
    pub(crate) fn open(&self, family: libc::c_int, registrant: EndpointRef) -> Result<()> {
        let fd = unsafe { libc::socket(family, self.ty, self.protocol) };
        if fd < 0 {
            self.capture_errno();
            return Err(SocketError::UnableToCreateSocket(io::Error::last_os_error()).into());
        }

        self.handle.store(fd, Ordering::Relaxed);
        self.apply_options(fd);
        self.register(fd, registrant)?;
        Ok(())
    }

    /// Takes ownership of an already-connected handle (an accepted
    /// connection), applies the endpoint options and registers.
    pub(crate) fn adopt(&self, fd: RawFd, registrant: EndpointRef) -> Result<()> {
        self.disconnect();
        self.handle.store(fd, Ordering::Relaxed);
        self.apply_options(fd);
        self.register(fd, registrant)?;
        Ok(())
    }

    /// Zero-timeout linger plus non-blocking mode, applied to every handle
    /// this endpoint ever owns.
    fn apply_options(&self, fd: RawFd) {
        let linger = libc::linger { l_onoff: 1, l_linger: 0 };
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &linger as *const _ as *const libc::c_void,
                mem::size_of::<libc::linger>() as libc::socklen_t,
            );
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }

    fn register(&self, fd: RawFd, registrant: EndpointRef) -> std::result::Result<(), PipeError> {
        match self.reactor.upgrade() {
            Some(core) => core.register(fd, registrant),
            None => {
                warn!(kind = %self.kind, fd, "reactor is gone, handle left unregistered");
                Ok(())
            }
        }
    }

    /// Unregisters from the reactor and closes the handle. Idempotent.
    pub(crate) fn disconnect(&self) {
        let fd = self.handle.swap(INVALID_HANDLE, Ordering::Relaxed);
        if fd == INVALID_HANDLE {
            return;
        }
        if let Some(core) = self.reactor.upgrade() {
            if let Err(err) = core.unregister(fd) {
                warn!(%err, fd, "could not wake the reactor while unregistering");
            }
        }
        unsafe { libc::close(fd) };
    }

    /// Wakes the owning reactor so the next multiplex cycle observes this
    /// endpoint's current interest.
    pub(crate) fn bump(&self) -> std::result::Result<(), PipeError> {
        match self.reactor.upgrade() {
            Some(core) => core.bump(),
            None => Ok(()),
        }
    }

    pub(crate) fn capture_local(&self) -> std::result::Result<Address, SocketError> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.handle(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc < 0 {
            self.capture_errno();
            return Err(SocketError::GetPeerName(io::Error::last_os_error()));
        }
        Ok(Address::from_raw(&storage))
    }

    pub(crate) fn capture_remote(&self) -> std::result::Result<Address, SocketError> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getpeername(
                self.handle(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc < 0 {
            self.capture_errno();
            return Err(SocketError::GetPeerName(io::Error::last_os_error()));
        }
        Ok(Address::from_raw(&storage))
    }
}

impl Drop for SocketCore {
    fn drop(&mut self) {
        let fd = self.handle.swap(INVALID_HANDLE, Ordering::Relaxed);
        if fd != INVALID_HANDLE {
            unsafe { libc::close(fd) };
        }
    }
}
