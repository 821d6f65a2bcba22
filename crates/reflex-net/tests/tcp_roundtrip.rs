use std::{
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use reflex_net::{
    Address, PumpMessage, Reactor, ReactorEvents, ReactorHandle,
    error::{Error, TalkerError},
    tcp::{ListenerEvents, NullTalkerEvents, TalkerEvents, TcpListener, TcpTalker},
};

struct Quit;
impl PumpMessage for Quit {
    fn is_quit(&self) -> bool {
        true
    }
}

struct SilentReactor;
impl ReactorEvents<Quit> for SilentReactor {}

fn spawn_reactor() -> (Arc<Reactor<Quit>>, thread::JoinHandle<()>) {
    let reactor = Arc::new(Reactor::new(Box::new(SilentReactor)).unwrap());
    let worker = {
        let reactor = Arc::clone(&reactor);
        thread::spawn(move || reactor.run().unwrap())
    };
    (reactor, worker)
}

/// Server side: every accepted talker echoes whatever arrives.
struct EchoFactory;
impl ListenerEvents for EchoFactory {
    fn create_talker(&self, reactor: &ReactorHandle) -> Option<Arc<TcpTalker>> {
        Some(TcpTalker::new(reactor, 1 << 16, Box::new(EchoTalker)))
    }
}

struct EchoTalker;
impl TalkerEvents for EchoTalker {
    fn on_receive(&self, talker: &TcpTalker) {
        let mut buf = [0u8; 4096];
        loop {
            let n = talker.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            talker.write(&buf[..n]).unwrap();
        }
    }
}

struct ClientEvents {
    connected: mpsc::Sender<()>,
    received: mpsc::Sender<Vec<u8>>,
}
impl TalkerEvents for ClientEvents {
    fn on_connect(&self, _talker: &TcpTalker) {
        let _ = self.connected.send(());
    }

    fn on_receive(&self, talker: &TcpTalker) {
        let mut buf = [0u8; 4096];
        loop {
            let n = talker.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            let _ = self.received.send(buf[..n].to_vec());
        }
    }
}

#[test]
fn tcp_roundtrip_preserves_order() {
    let (server, server_worker) = spawn_reactor();
    let listener = TcpListener::new(&server.handle(), Box::new(EchoFactory));
    listener.listen_port(0, 8).unwrap();
    let port = listener.local().port();
    assert_ne!(port, 0);

    let (client, client_worker) = spawn_reactor();
    let (connected_tx, connected_rx) = mpsc::channel();
    let (received_tx, received_rx) = mpsc::channel();
    let talker = TcpTalker::new(
        &client.handle(),
        1 << 16,
        Box::new(ClientEvents { connected: connected_tx, received: received_tx }),
    );
    talker.set_remote(Address::parse("::1", port).unwrap());
    talker.connect().unwrap();

    connected_rx.recv_timeout(Duration::from_secs(5)).expect("connect never completed");

    // Two separate writes must come back as one uninterrupted byte stream,
    // with no framing visible.
    talker.write(b"hello ").unwrap();
    talker.write(b"world").unwrap();

    let mut echoed = Vec::new();
    while echoed.len() < 11 {
        let chunk = received_rx.recv_timeout(Duration::from_secs(5)).expect("echo never arrived");
        echoed.extend_from_slice(&chunk);
    }
    assert_eq!(echoed, b"hello world");

    client.post(Quit).unwrap();
    server.post(Quit).unwrap();
    client_worker.join().unwrap();
    server_worker.join().unwrap();
}

#[test]
fn write_outside_connected_state_fails() {
    let (reactor, worker) = spawn_reactor();

    let talker = TcpTalker::new(&reactor.handle(), 1024, Box::new(NullTalkerEvents));
    let err = talker.write(b"too early").unwrap_err();
    assert!(matches!(err, Error::Talker(TalkerError::InvalidSendState(_))));

    // The bytes stay queued; only the drain was refused.
    let err = talker.connect().unwrap_err();
    assert!(matches!(err, Error::Talker(TalkerError::InvalidRemoteAddress)));

    reactor.post(Quit).unwrap();
    worker.join().unwrap();
}
