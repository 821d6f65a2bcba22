use std::{
    collections::{BTreeMap, VecDeque},
    io, mem,
    os::fd::RawFd,
    ptr,
    sync::{Arc, Mutex, Weak},
};

use tracing::{debug, warn};

use crate::{
    endpoint::{SocketCore, SocketKind},
    error::{Error, ListenerError, PipeError, Result},
    lock_unpoisoned,
    tcp::{ConnState, TcpListener, TcpTalker},
    udp::UdpEndpoint,
};

/// Linux reports a signal-interrupted select with this errno when no
/// handler restarts the call.
const ERESTARTNOHAND: i32 = 514;

/// A message the reactor drains from its queue. The implementation decides
/// which value terminates the loop.
pub trait PumpMessage: Send {
    fn is_quit(&self) -> bool;
}

/// Reactor-level lifecycle and error hooks. All default to no-ops.
///
/// `error_handler` receives every endpoint failure surfaced while
/// dispatching readiness; the reactor keeps running afterwards. The
/// endpoint is absent for failures with no owner, such as a failing accept.
pub trait ReactorEvents<M>: Send + Sync {
    fn on_init(&self) {}
    fn on_quit(&self) {}
    fn on_message(&self, _msg: M) {}
    fn on_error(&self, _err: &io::Error) {}
    fn error_handler(&self, _err: &Error, _endpoint: Option<&EndpointRef>) {}
}

/// A registered endpoint, tagged by kind.
#[derive(Clone)]
pub enum EndpointRef {
    Talker(Arc<TcpTalker>),
    Listener(Arc<TcpListener>),
    Udp(Arc<UdpEndpoint>),
}

impl EndpointRef {
    pub fn kind(&self) -> SocketKind {
        self.socket().kind()
    }

    pub fn talker(&self) -> Option<&Arc<TcpTalker>> {
        match self {
            Self::Talker(talker) => Some(talker),
            _ => None,
        }
    }

    pub fn listener(&self) -> Option<&Arc<TcpListener>> {
        match self {
            Self::Listener(listener) => Some(listener),
            _ => None,
        }
    }

    pub fn udp(&self) -> Option<&Arc<UdpEndpoint>> {
        match self {
            Self::Udp(udp) => Some(udp),
            _ => None,
        }
    }

    pub(crate) fn socket(&self) -> &SocketCore {
        match self {
            Self::Talker(talker) => talker.socket(),
            Self::Listener(listener) => listener.socket(),
            Self::Udp(udp) => udp.socket(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Self::Talker(talker) => {
                talker.sending() || talker.state() == ConnState::Connecting
            }
            Self::Udp(udp) => udp.sending(),
            Self::Listener(_) => false,
        }
    }

    fn disconnect(&self) {
        match self {
            Self::Talker(talker) => talker.disconnect(),
            Self::Listener(listener) => listener.socket().disconnect(),
            Self::Udp(udp) => udp.disconnect(),
        }
    }
}

/// Anonymous pipe whose read end sits in every multiplex read set. One
/// written byte returns the reactor from its block.
struct WakePipe {
    rd: RawFd,
    wr: RawFd,
}

impl WakePipe {
    fn new() -> std::result::Result<Self, PipeError> {
        let mut fds: [libc::c_int; 2] = [0; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(PipeError::UnableToOpenPipe(io::Error::last_os_error()));
        }
        unsafe {
            let flags = libc::fcntl(fds[0], libc::F_GETFL);
            libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        Ok(Self { rd: fds[0], wr: fds[1] })
    }

    fn bump(&self) -> std::result::Result<(), PipeError> {
        let byte = b"~";
        if unsafe { libc::write(self.wr, byte.as_ptr() as *const libc::c_void, 1) } < 0 {
            return Err(PipeError::UnableToWritePipe(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Empties the read end after a cycle so stale wake bytes do not spin
    /// the loop.
    fn drain(&self) -> std::result::Result<(), PipeError> {
        let mut byte = [0u8; 1];
        loop {
            let n = unsafe { libc::read(self.rd, byte.as_mut_ptr() as *mut libc::c_void, 1) };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(errno) if errno == libc::EWOULDBLOCK || errno == libc::EAGAIN => break,
                    _ => return Err(PipeError::UnableToReadPipe(err)),
                }
            }
            if n == 0 {
                break;
            }
        }
        Ok(())
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.rd);
            libc::close(self.wr);
        }
    }
}

/// State shared between the reactor worker and the endpoints it owns:
/// the descriptor registry and the wake channel.
pub(crate) struct ReactorCore {
    registry: Mutex<BTreeMap<RawFd, EndpointRef>>,
    wake: WakePipe,
}

impl ReactorCore {
    pub(crate) fn register(
        &self,
        fd: RawFd,
        endpoint: EndpointRef,
    ) -> std::result::Result<(), PipeError> {
        if fd as usize >= libc::FD_SETSIZE {
            warn!(fd, "descriptor exceeds the select set size and will never be polled");
        }
        lock_unpoisoned(&self.registry).insert(fd, endpoint);
        self.wake.bump()
    }

    pub(crate) fn unregister(&self, fd: RawFd) -> std::result::Result<(), PipeError> {
        if lock_unpoisoned(&self.registry).remove(&fd).is_some() {
            self.wake.bump()?;
        }
        Ok(())
    }

    pub(crate) fn bump(&self) -> std::result::Result<(), PipeError> {
        self.wake.bump()
    }
}

/// Construction-time reference to a reactor, handed to endpoints so they
/// can register themselves.
#[derive(Clone)]
pub struct ReactorHandle {
    core: Arc<ReactorCore>,
}

impl ReactorHandle {
    pub(crate) fn downgrade(&self) -> Weak<ReactorCore> {
        Arc::downgrade(&self.core)
    }
}

/// Single-worker socket reactor.
///
/// Owns a set of registered endpoints and multiplexes their readiness with
/// a select-style block that is interruptible through the wake channel.
/// Readiness dispatch per descriptor is error, then read, then write, in
/// ascending descriptor order. The application message queue is serviced
/// inside the same loop: [`post`](Self::post) may be called from any
/// thread, and a message whose [`PumpMessage::is_quit`] is true shuts the
/// reactor down.
pub struct Reactor<M: PumpMessage> {
    core: Arc<ReactorCore>,
    queue: Mutex<VecDeque<M>>,
    events: Box<dyn ReactorEvents<M>>,
}

impl<M: PumpMessage> Reactor<M> {
    pub fn new(events: Box<dyn ReactorEvents<M>>) -> Result<Self> {
        Ok(Self {
            core: Arc::new(ReactorCore {
                registry: Mutex::new(BTreeMap::new()),
                wake: WakePipe::new()?,
            }),
            queue: Mutex::new(VecDeque::new()),
            events,
        })
    }

    /// The reference endpoints are constructed against.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle { core: self.core.clone() }
    }

    /// Enqueues an application message and wakes the worker.
    pub fn post(&self, msg: M) -> Result<()> {
        lock_unpoisoned(&self.queue).push_back(msg);
        self.core.bump()?;
        Ok(())
    }

    /// Currently registered endpoints.
    pub fn endpoint_count(&self) -> usize {
        lock_unpoisoned(&self.core.registry).len()
    }

    /// Drives the multiplex loop until a quit message arrives. On exit
    /// every endpoint still registered is disconnected and released.
    pub fn run(&self) -> Result<()> {
        self.events.on_init();

        loop {
            let mut read_set = empty_set();
            let mut write_set = empty_set();
            let mut error_set = empty_set();

            let wake_rd = self.core.wake.rd;
            unsafe { libc::FD_SET(wake_rd, &mut read_set) };
            let mut maxfd = wake_rd;

            {
                let registry = lock_unpoisoned(&self.core.registry);
                for (&fd, endpoint) in registry.iter() {
                    if fd as usize >= libc::FD_SETSIZE {
                        continue;
                    }
                    unsafe {
                        libc::FD_SET(fd, &mut read_set);
                        libc::FD_SET(fd, &mut error_set);
                        if endpoint.wants_write() {
                            libc::FD_SET(fd, &mut write_set);
                        }
                    }
                    maxfd = maxfd.max(fd);
                }
            }

            let mut nready = unsafe {
                libc::select(
                    maxfd + 1,
                    &mut read_set,
                    &mut write_set,
                    &mut error_set,
                    ptr::null_mut(),
                )
            };

            if nready < 0 {
                let err = io::Error::last_os_error();
                let errno = err.raw_os_error().unwrap_or(0);
                if errno == libc::EINTR || errno == ERESTARTNOHAND {
                    if !self.pump_queue() {
                        break;
                    }
                    continue;
                }
                self.events.on_error(&err);
                continue;
            }

            if unsafe { libc::FD_ISSET(wake_rd, &read_set) } {
                nready -= 1;
                if !self.pump_queue() {
                    break;
                }
            }

            for fd in 0..=maxfd {
                if nready <= 0 {
                    break;
                }
                if fd == wake_rd {
                    continue;
                }

                if unsafe { libc::FD_ISSET(fd, &error_set) } {
                    nready -= 1;
                    if let Some(endpoint) = self.endpoint_at(fd) {
                        self.dispatch_error(fd, &endpoint);
                    }
                }
                if nready > 0 && unsafe { libc::FD_ISSET(fd, &read_set) } {
                    nready -= 1;
                    if let Some(endpoint) = self.endpoint_at(fd) {
                        self.dispatch_read(&endpoint);
                    }
                }
                if nready > 0 && unsafe { libc::FD_ISSET(fd, &write_set) } {
                    nready -= 1;
                    if let Some(endpoint) = self.endpoint_at(fd) {
                        self.dispatch_write(&endpoint);
                    }
                }
            }

            // Messages posted from inside the callbacks above.
            if !self.pump_queue() {
                break;
            }
            self.core.wake.drain()?;
        }

        self.events.on_quit();
        self.shutdown();
        Ok(())
    }

    /// Drains the application queue. Returns false when a quit message was
    /// observed.
    fn pump_queue(&self) -> bool {
        loop {
            let Some(msg) = lock_unpoisoned(&self.queue).pop_front() else {
                return true;
            };
            if msg.is_quit() {
                return false;
            }
            self.events.on_message(msg);
        }
    }

    fn endpoint_at(&self, fd: RawFd) -> Option<EndpointRef> {
        lock_unpoisoned(&self.core.registry).get(&fd).cloned()
    }

    fn dispatch_error(&self, fd: RawFd, endpoint: &EndpointRef) {
        let mut so_error: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut so_error as *mut _ as *mut libc::c_void,
                &mut len,
            );
        }
        endpoint.socket().set_errno(so_error);

        match endpoint {
            EndpointRef::Talker(talker) => talker.events().on_error(talker),
            EndpointRef::Listener(listener) => listener.events().on_error(listener),
            EndpointRef::Udp(udp) => udp.events().on_error(udp),
        }
    }

    fn dispatch_read(&self, endpoint: &EndpointRef) {
        match endpoint {
            EndpointRef::Listener(listener) => self.accept_loop(listener),
            EndpointRef::Talker(talker) => {
                if talker.state() == ConnState::Connecting {
                    talker.set_state(ConnState::Connected);
                    if let Err(err) = talker.capture_addresses() {
                        self.events.error_handler(&err, Some(endpoint));
                    }
                    talker.events().on_connect(talker);
                }

                loop {
                    match talker.recv() {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(err) => {
                            self.events.error_handler(&err, Some(endpoint));
                            break;
                        }
                    }
                }

                talker.events().on_receive(talker);

                if talker.state() == ConnState::Disconnected {
                    talker.close();
                }
            }
            EndpointRef::Udp(udp) => {
                loop {
                    match udp.recv() {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(err) => {
                            self.events.error_handler(&err, Some(endpoint));
                            break;
                        }
                    }
                }

                if let Err(err) = udp.dispatch_received() {
                    self.events.error_handler(&err, Some(endpoint));
                }
            }
        }
    }

    fn dispatch_write(&self, endpoint: &EndpointRef) {
        match endpoint {
            EndpointRef::Talker(talker) => {
                if talker.state() == ConnState::Connecting {
                    talker.set_state(ConnState::Connected);
                    if let Err(err) = talker.capture_addresses() {
                        self.events.error_handler(&err, Some(endpoint));
                    }
                    talker.events().on_connect(talker);
                } else if let Err(err) = talker.flush(true) {
                    self.events.error_handler(&err, Some(endpoint));
                }
            }
            EndpointRef::Udp(udp) => {
                if let Err(err) = udp.flush(true) {
                    self.events.error_handler(&err, Some(endpoint));
                }
            }
            EndpointRef::Listener(_) => {}
        }
    }

    fn accept_loop(&self, listener: &Arc<TcpListener>) {
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut socklen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let fd = unsafe {
                libc::accept(
                    listener.socket().handle(),
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut socklen,
                )
            };
            if fd < 0 {
                let errno = listener.socket().capture_errno();
                if errno == libc::EWOULDBLOCK || errno == libc::EAGAIN {
                    break;
                }
                let err: Error =
                    ListenerError::UnableToAcceptSocket(io::Error::from_raw_os_error(errno))
                        .into();
                self.events.error_handler(&err, None);
                break;
            }

            match listener.events().create_talker(&self.handle()) {
                Some(talker) => match talker.adopt(fd) {
                    Ok(()) => talker.events().on_connect(&talker),
                    Err(err) => {
                        self.events
                            .error_handler(&err, Some(&EndpointRef::Talker(talker.clone())));
                    }
                },
                None => {
                    // Admission refused: the handle goes straight back.
                    debug!(fd, "connection refused by the talker factory");
                    unsafe { libc::close(fd) };
                }
            }
        }
    }

    /// Disconnects and releases every endpoint still registered.
    fn shutdown(&self) {
        loop {
            let endpoint = {
                let mut registry = lock_unpoisoned(&self.core.registry);
                let Some((&fd, _)) = registry.iter().next() else {
                    break;
                };
                registry.remove(&fd)
            };
            if let Some(endpoint) = endpoint {
                endpoint.disconnect();
            }
        }
    }
}

fn empty_set() -> libc::fd_set {
    unsafe {
        let mut set = mem::zeroed();
        libc::FD_ZERO(&mut set);
        set
    }
}
