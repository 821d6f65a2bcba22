use std::{
    io,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
};

use reflex_buffer::RingBuffer;
use tracing::debug;

use crate::{
    addr::{Address, Family},
    endpoint::{SocketCore, SocketKind},
    error::{Error, Result, TalkerError},
    lock_unpoisoned,
    reactor::{EndpointRef, ReactorHandle},
};

/// Stack staging chunk for the kernel push/pull loops.
const CHUNK_SIZE: usize = 2048;
/// Width of the in-ring length prefix. Internal bookkeeping only, stripped
/// before bytes reach the wire.
const LEN_PREFIX_SIZE: usize = size_of::<i32>();

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::IntoStaticStr, strum::FromRepr)]
#[repr(u8)]
pub enum ConnState {
    Undefined,
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle callbacks for a [`TcpTalker`]. All default to no-ops.
///
/// `on_receive` fires after the reactor has drained the socket into the read
/// ring; pull the bytes out with [`TcpTalker::read`] or [`TcpTalker::peek`].
/// `on_error` fires on error-readiness; the captured errno is available via
/// [`TcpTalker::last_errno`].
pub trait TalkerEvents: Send + Sync {
    fn on_connect(&self, _talker: &TcpTalker) {}
    fn on_receive(&self, _talker: &TcpTalker) {}
    fn on_close(&self, _talker: &TcpTalker) {}
    fn on_error(&self, _talker: &TcpTalker) {}
}

/// No-op handler for talkers that are only written to.
pub struct NullTalkerEvents;
impl TalkerEvents for NullTalkerEvents {}

/// Bidirectional byte-stream endpoint.
///
/// Outbound bytes are staged in the write ring as ⟨length-prefix, payload⟩
/// records so a partially accepted record can be resumed: the consumed part
/// is dropped from the ring and the prefix is rewritten in place to the
/// residual length. The wire carries the caller's payload bytes only.
///
/// `write` may be called from any thread; the reactor worker drives
/// everything else.
pub struct TcpTalker {
    core: SocketCore,
    state: AtomicU8,
    sending: AtomicBool,
    send_lock: Mutex<()>,
    local: Mutex<Address>,
    remote: Mutex<Address>,
    rbuf: RingBuffer,
    wbuf: RingBuffer,
    events: Box<dyn TalkerEvents>,
    weak_self: Weak<Self>,
}

impl TcpTalker {
    /// Creates a talker whose rings hold `bufsize` bytes each. The talker
    /// opens its socket lazily, in [`connect`](Self::connect) or when
    /// adopting an accepted handle.
    pub fn new(reactor: &ReactorHandle, bufsize: usize, events: Box<dyn TalkerEvents>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            core: SocketCore::new(
                SocketKind::TcpTalker,
                libc::SOCK_STREAM,
                libc::IPPROTO_TCP,
                reactor.downgrade(),
            ),
            state: AtomicU8::new(ConnState::Undefined as u8),
            sending: AtomicBool::new(false),
            send_lock: Mutex::new(()),
            local: Mutex::new(Address::default()),
            remote: Mutex::new(Address::default()),
            rbuf: RingBuffer::new(bufsize),
            wbuf: RingBuffer::new(bufsize),
            events,
            weak_self: weak.clone(),
        })
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_repr(self.state.load(Ordering::Relaxed)).unwrap_or(ConnState::Undefined)
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn local(&self) -> Address {
        *lock_unpoisoned(&self.local)
    }

    pub fn remote(&self) -> Address {
        *lock_unpoisoned(&self.remote)
    }

    pub fn set_remote(&self, addr: Address) {
        *lock_unpoisoned(&self.remote) = addr;
    }

    pub fn last_errno(&self) -> i32 {
        self.core.last_errno()
    }

    pub(crate) fn sending(&self) -> bool {
        self.sending.load(Ordering::Relaxed)
    }

    /// Bytes waiting in the read ring.
    pub fn buffered(&self) -> usize {
        self.rbuf.used()
    }

    /// Issues a non-blocking connect towards the configured remote address.
    ///
    /// Synchronous completion moves straight to `Connected` and fires
    /// `on_connect`; an in-progress connect parks in `Connecting` until the
    /// reactor observes readiness. Anything else fails with
    /// `UnableToConnect` and leaves the talker unopened.
    pub fn connect(&self) -> Result<()> {
        let remote = self.remote();
        let family = match remote.family() {
            Family::V4 => libc::AF_INET,
            Family::V6 => libc::AF_INET6,
            Family::Undefined => return Err(TalkerError::InvalidRemoteAddress.into()),
        };

        self.core.open(family, self.endpoint_ref())?;
        self.set_state(ConnState::Disconnected);

        let (storage, socklen) = remote.to_raw()?;
        let rc = unsafe {
            libc::connect(
                self.core.handle(),
                &storage as *const _ as *const libc::sockaddr,
                socklen,
            )
        };

        if rc == 0 {
            self.set_state(ConnState::Connected);
            self.events.on_connect(self);
            return Ok(());
        }

        let errno = self.core.capture_errno();
        if errno != libc::EINPROGRESS && errno != libc::EWOULDBLOCK && errno != libc::EAGAIN {
            let err = TalkerError::UnableToConnect(io::Error::from_raw_os_error(errno));
            self.core.disconnect();
            self.set_state(ConnState::Undefined);
            return Err(err.into());
        }

        self.set_state(ConnState::Connecting);
        // The reactor must pick up write interest for the completion.
        self.core.bump()?;
        Ok(())
    }

    /// Enqueues `src` for transmission and kicks off a drain. Thread-safe.
    ///
    /// The prefix and payload go into the write ring as one atomic batch;
    /// if they do not fit, nothing is enqueued.
    pub fn write(&self, src: &[u8]) -> Result<()> {
        {
            let mut ring = self.wbuf.lock();
            let needed = LEN_PREFIX_SIZE + src.len();
            if ring.free() < needed {
                return Err(Error::Ring(reflex_buffer::RingError::AttemptToExceedCapacity {
                    used: ring.used(),
                    requested: needed,
                    capacity: ring.capacity(),
                }));
            }
            ring.append(&(src.len() as i32).to_ne_bytes())?;
            ring.append(src)?;
        }

        self.flush(false)?;
        if self.sending() {
            // Residual bytes: the reactor has to poll write-readiness.
            self.core.bump()?;
        }
        Ok(())
    }

    /// Drains the write ring into the kernel.
    ///
    /// Non-blocking on the send mutex: if another thread or the reactor is
    /// already draining, this is a no-op. `override_guard` is the reactor's
    /// write-readiness path, which must make progress even while `sending`
    /// is set.
    pub fn flush(&self, override_guard: bool) -> Result<()> {
        let Ok(_guard) = self.send_lock.try_lock() else {
            return Ok(());
        };

        if !override_guard && self.sending() {
            return Ok(());
        }

        if self.wbuf.is_empty() {
            self.sending.store(false, Ordering::Relaxed);
            return Ok(());
        }

        if self.state() != ConnState::Connected {
            return Err(TalkerError::InvalidSendState(self.state().into()).into());
        }

        self.sending.store(true, Ordering::Relaxed);
        let mut chunk = [0u8; CHUNK_SIZE];

        loop {
            if self.wbuf.is_empty() {
                self.sending.store(false, Ordering::Relaxed);
                break;
            }

            let mut prefix = [0u8; LEN_PREFIX_SIZE];
            let got = self.wbuf.peek(Some(&mut prefix), 0, LEN_PREFIX_SIZE)?;
            if got != LEN_PREFIX_SIZE {
                return Err(TalkerError::ReadingWritePacketLength {
                    expected: LEN_PREFIX_SIZE,
                    read: got,
                }
                .into());
            }
            let packet_len = i32::from_ne_bytes(prefix) as usize;

            let mut sent = 0;
            while sent < packet_len {
                let want = (packet_len - sent).min(CHUNK_SIZE);
                let got = self.wbuf.peek(Some(&mut chunk[..want]), LEN_PREFIX_SIZE + sent, want)?;
                if got != want {
                    return Err(TalkerError::ReadingWritePacketLength {
                        expected: want,
                        read: got,
                    }
                    .into());
                }

                match self.send_chunk(&chunk[..want])? {
                    // Kernel is full; write-readiness resumes the drain.
                    None => break,
                    Some(n) => {
                        sent += n;
                        if n != want {
                            break;
                        }
                    }
                }
            }

            let residual = packet_len - sent;
            let mut ring = self.wbuf.lock();
            ring.consume(None, 0, sent + if residual == 0 { LEN_PREFIX_SIZE } else { 0 })?;
            if residual > 0 {
                ring.modify(&(residual as i32).to_ne_bytes(), 0)?;
                break;
            }
        }

        Ok(())
    }

    fn send_chunk(&self, buf: &[u8]) -> Result<Option<usize>> {
        let n = unsafe {
            libc::send(
                self.core.handle(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            let errno = self.core.capture_errno();
            if errno == libc::EWOULDBLOCK || errno == libc::EAGAIN {
                return Ok(None);
            }
            return Err(TalkerError::SendingPacket(io::Error::from_raw_os_error(errno)).into());
        }
        Ok(Some(n as usize))
    }

    /// Drains the kernel into the read ring; the reactor's read-readiness
    /// path. A kernel read of zero means the peer closed.
    pub(crate) fn recv(&self) -> Result<usize> {
        let mut buf = [0u8; CHUNK_SIZE];
        let mut total = 0;

        loop {
            let n = unsafe {
                libc::recv(
                    self.core.handle(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n > 0 {
                self.rbuf.append(&buf[..n as usize])?;
                total += n as usize;
            } else if n == 0 {
                debug!(fd = self.core.handle(), "peer closed");
                self.set_state(ConnState::Disconnected);
                break;
            } else {
                let errno = self.core.capture_errno();
                if errno == libc::EWOULDBLOCK || errno == libc::EAGAIN {
                    break;
                }
                return Err(
                    TalkerError::UnableToRecvData(io::Error::from_raw_os_error(errno)).into()
                );
            }
        }

        Ok(total)
    }

    /// Copies buffered inbound bytes without draining them.
    pub fn peek(&self, dest: &mut [u8]) -> Result<usize> {
        let len = dest.len();
        Ok(self.rbuf.peek(Some(dest), 0, len)?)
    }

    /// Drains buffered inbound bytes into `dest`.
    pub fn read(&self, dest: &mut [u8]) -> Result<usize> {
        let len = dest.len();
        Ok(self.rbuf.consume(Some(dest), 0, len)?)
    }

    /// Unregisters and closes the handle; the remote address is forgotten.
    pub fn disconnect(&self) {
        self.core.disconnect();
        self.set_state(ConnState::Disconnected);
        lock_unpoisoned(&self.remote).clear();
    }

    /// Disconnect plus the `on_close` callback.
    pub fn close(&self) {
        self.disconnect();
        self.events.on_close(self);
    }

    /// Adopts an accepted kernel handle: options, registration, address
    /// capture, `Connected`.
    pub(crate) fn adopt(&self, fd: std::os::fd::RawFd) -> Result<()> {
        self.core.adopt(fd, self.endpoint_ref())?;
        self.capture_addresses()?;
        self.set_state(ConnState::Connected);
        Ok(())
    }

    pub(crate) fn capture_addresses(&self) -> Result<()> {
        let local = self.core.capture_local()?;
        let remote = self.core.capture_remote()?;
        *lock_unpoisoned(&self.local) = local;
        *lock_unpoisoned(&self.remote) = remote;
        Ok(())
    }

    pub(crate) fn events(&self) -> &dyn TalkerEvents {
        self.events.as_ref()
    }

    pub(crate) fn socket(&self) -> &SocketCore {
        &self.core
    }

    fn endpoint_ref(&self) -> EndpointRef {
        EndpointRef::Talker(self.weak_self.upgrade().expect("talker constructed outside an Arc"))
    }
}
