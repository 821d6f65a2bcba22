use std::{
    io,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use reflex_buffer::RingBuffer;
use tracing::debug;

use crate::{
    addr::{self, Address, Family},
    endpoint::{SocketCore, SocketKind},
    error::{AddressError, Error, Result, UdpError},
    lock_unpoisoned,
    reactor::{EndpointRef, ReactorHandle},
};

/// Largest UDP payload: max IP packet minus minimal IP and UDP headers.
pub const MAX_DATAGRAM: usize = 65507;

/// Per-record ring header: ⟨total_length, data_length, peer address⟩.
/// `total_length` covers the header itself plus the payload.
const HEADER_LEN: usize = 2 * size_of::<u32>() + addr::ENCODED_LEN;

/// Datagram callbacks for a [`UdpEndpoint`]. All default to no-ops.
///
/// `on_datagram` fires once per inbound datagram, boundaries preserved.
pub trait UdpEvents: Send + Sync {
    fn on_datagram(&self, _endpoint: &UdpEndpoint, _from: &Address, _data: &[u8]) {}
    fn on_close(&self, _endpoint: &UdpEndpoint) {}
    fn on_error(&self, _endpoint: &UdpEndpoint) {}
}

enum SendOutcome {
    Sent,
    /// Datagram too large for the path; dropped, drain continues.
    Dropped,
    WouldBlock,
}

/// Datagram endpoint.
///
/// Both rings hold whole-datagram records tagged with the peer address, so
/// message boundaries survive the staging buffers. Outbound records are
/// transmitted with `sendto` as a unit; a datagram is never fragmented by
/// this layer.
pub struct UdpEndpoint {
    core: SocketCore,
    sending: AtomicBool,
    send_lock: Mutex<()>,
    local: Mutex<Address>,
    rbuf: RingBuffer,
    wbuf: RingBuffer,
    /// Staging for one inbound record while it is assembled or popped.
    rcv_scratch: Mutex<Box<[u8]>>,
    /// Staging for the outbound record currently being pushed.
    snd_scratch: Mutex<Box<[u8]>>,
    events: Box<dyn UdpEvents>,
    weak_self: Weak<Self>,
}

impl UdpEndpoint {
    pub fn new(reactor: &ReactorHandle, bufsize: usize, events: Box<dyn UdpEvents>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            core: SocketCore::new(
                SocketKind::Udp,
                libc::SOCK_DGRAM,
                libc::IPPROTO_UDP,
                reactor.downgrade(),
            ),
            sending: AtomicBool::new(false),
            send_lock: Mutex::new(()),
            local: Mutex::new(Address::default()),
            rbuf: RingBuffer::new(bufsize),
            wbuf: RingBuffer::new(bufsize),
            rcv_scratch: Mutex::new(vec![0; HEADER_LEN + MAX_DATAGRAM].into_boxed_slice()),
            snd_scratch: Mutex::new(vec![0; HEADER_LEN + MAX_DATAGRAM].into_boxed_slice()),
            events,
            weak_self: weak.clone(),
        })
    }

    /// The bound local address, with the kernel-assigned port once `bind`
    /// has succeeded.
    pub fn local(&self) -> Address {
        *lock_unpoisoned(&self.local)
    }

    pub fn last_errno(&self) -> i32 {
        self.core.last_errno()
    }

    pub(crate) fn sending(&self) -> bool {
        self.sending.load(Ordering::Relaxed)
    }

    /// Binds the IPv6 wildcard on `port`.
    pub fn bind_port(&self, port: u16) -> Result<()> {
        self.bind(Address::any(port))
    }

    /// Binds a presentation-form numeric address.
    pub fn bind_ip(&self, ip: &str, port: u16) -> Result<()> {
        self.bind(Address::parse(ip, port)?)
    }

    /// Binds `addr`. Fails with `AlreadyBound` when the endpoint already
    /// owns a handle.
    pub fn bind(&self, addr: Address) -> Result<()> {
        if self.core.is_open() {
            return Err(UdpError::AlreadyBound.into());
        }

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
            let err = UdpError::UnableToBindSocket(io::Error::last_os_error());
            self.close();
            return Err(err.into());
        }

        *lock_unpoisoned(&self.local) = self.core.capture_local()?;
        Ok(())
    }

    /// Enqueues one datagram for `to` and kicks off a drain. Thread-safe.
    ///
    /// Header and payload go into the write ring as one atomic batch; if
    /// the record does not fit, nothing is enqueued.
    pub fn write(&self, to: &Address, src: &[u8]) -> Result<()> {
        if src.len() > MAX_DATAGRAM {
            return Err(
                UdpError::SendingPacket(io::Error::from_raw_os_error(libc::EMSGSIZE)).into()
            );
        }

        let header = record_header(to, src.len());
        {
            let mut ring = self.wbuf.lock();
            let needed = HEADER_LEN + src.len();
            if ring.free() < needed {
                return Err(Error::Ring(reflex_buffer::RingError::AttemptToExceedCapacity {
                    used: ring.used(),
                    requested: needed,
                    capacity: ring.capacity(),
                }));
            }
            ring.append(&header)?;
            ring.append(src)?;
        }

        self.flush(false)?;
        if self.sending() {
            // Residual records: the reactor has to poll write-readiness.
            self.core.bump()?;
        }
        Ok(())
    }

    /// Drains queued datagrams into the kernel, whole records only.
    ///
    /// Same non-blocking send-mutex discipline as the stream endpoint:
    /// a failed try-acquire or an in-flight `sending` (without
    /// `override_guard`) is a no-op.
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

        self.sending.store(true, Ordering::Relaxed);
        let mut scratch = lock_unpoisoned(&self.snd_scratch);

        loop {
            if self.wbuf.is_empty() {
                self.sending.store(false, Ordering::Relaxed);
                break;
            }

            let mut header = [0u8; HEADER_LEN];
            let got = self.wbuf.peek(Some(&mut header), 0, HEADER_LEN)?;
            if got != HEADER_LEN {
                return Err(UdpError::ReadingWritePacketLength {
                    expected: HEADER_LEN,
                    read: got,
                }
                .into());
            }
            let (total, data_len, peer) = parse_header(&header)?;

            let got = self.wbuf.peek(Some(&mut scratch[..total]), 0, total)?;
            if got != total {
                return Err(UdpError::ReadingWritePacketLength { expected: total, read: got }
                    .into());
            }

            match self.send_datagram(&peer, &scratch[HEADER_LEN..HEADER_LEN + data_len])? {
                SendOutcome::Sent | SendOutcome::Dropped => {
                    self.wbuf.consume(None, 0, total)?;
                }
                // Kernel is full; write-readiness resumes the drain.
                SendOutcome::WouldBlock => break,
            }
        }

        Ok(())
    }

    fn send_datagram(&self, to: &Address, data: &[u8]) -> Result<SendOutcome> {
        let (storage, socklen) = to.to_raw()?;
        let n = unsafe {
            libc::sendto(
                self.core.handle(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
                libc::MSG_NOSIGNAL,
                &storage as *const _ as *const libc::sockaddr,
                socklen,
            )
        };
        if n < 0 {
            let errno = self.core.capture_errno();
            if errno == libc::EWOULDBLOCK || errno == libc::EAGAIN {
                return Ok(SendOutcome::WouldBlock);
            }
            if errno == libc::EMSGSIZE {
                debug!(to = %to, len = data.len(), "datagram dropped, message too large");
                return Ok(SendOutcome::Dropped);
            }
            return Err(UdpError::SendingPacket(io::Error::from_raw_os_error(errno)).into());
        }
        Ok(SendOutcome::Sent)
    }

    /// Drains the kernel into the read ring; the reactor's read-readiness
    /// path. Each datagram becomes one framed record.
    pub(crate) fn recv(&self) -> Result<usize> {
        let mut scratch = lock_unpoisoned(&self.rcv_scratch);
        let mut total_received = 0;

        loop {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut socklen = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let n = unsafe {
                libc::recvfrom(
                    self.core.handle(),
                    scratch[HEADER_LEN..].as_mut_ptr() as *mut libc::c_void,
                    MAX_DATAGRAM,
                    0,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut socklen,
                )
            };
            if n < 0 {
                let errno = self.core.capture_errno();
                if errno == libc::EWOULDBLOCK || errno == libc::EAGAIN {
                    break;
                }
                return Err(
                    UdpError::UnableToRecvData(io::Error::from_raw_os_error(errno)).into()
                );
            }

            let n = n as usize;
            let from = Address::from_raw(&storage);
            let header = record_header(&from, n);
            scratch[..HEADER_LEN].copy_from_slice(&header);
            self.rbuf.append(&scratch[..HEADER_LEN + n])?;
            total_received += n;
        }

        Ok(total_received)
    }

    /// Pops buffered records one at a time and hands each datagram to the
    /// user callback.
    pub(crate) fn dispatch_received(&self) -> Result<()> {
        let mut scratch = lock_unpoisoned(&self.rcv_scratch);

        loop {
            let mut header = [0u8; HEADER_LEN];
            let got = self.rbuf.peek(Some(&mut header), 0, HEADER_LEN)?;
            if got == 0 {
                break;
            }
            if got != HEADER_LEN {
                return Err(UdpError::ReadingWritePacketLength {
                    expected: HEADER_LEN,
                    read: got,
                }
                .into());
            }
            let (total, data_len, from) = parse_header(&header)?;

            let got = self.rbuf.consume(Some(&mut scratch[..total]), 0, total)?;
            if got != total {
                return Err(UdpError::ReadingWritePacketLength { expected: total, read: got }
                    .into());
            }

            self.events.on_datagram(self, &from, &scratch[HEADER_LEN..HEADER_LEN + data_len]);
        }

        Ok(())
    }

    /// Unregisters and closes the handle; the local address is forgotten.
    pub fn disconnect(&self) {
        self.core.disconnect();
        lock_unpoisoned(&self.local).clear();
    }

    /// Disconnect plus the `on_close` callback.
    pub fn close(&self) {
        self.disconnect();
        self.events.on_close(self);
    }

    pub(crate) fn events(&self) -> &dyn UdpEvents {
        self.events.as_ref()
    }

    pub(crate) fn socket(&self) -> &SocketCore {
        &self.core
    }

    fn endpoint_ref(&self) -> EndpointRef {
        EndpointRef::Udp(self.weak_self.upgrade().expect("endpoint constructed outside an Arc"))
    }
}

fn record_header(peer: &Address, data_len: usize) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&((HEADER_LEN + data_len) as u32).to_ne_bytes());
    header[4..8].copy_from_slice(&(data_len as u32).to_ne_bytes());
    header[8..].copy_from_slice(&peer.encode());
    header
}

fn parse_header(header: &[u8; HEADER_LEN]) -> Result<(usize, usize, Address)> {
    let total = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let data_len = u32::from_ne_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let peer = Address::decode(&header[8..])?;
    Ok((total, data_len, peer))
}
