use std::{
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use reflex_net::{
    Address, PumpMessage, Reactor, ReactorEvents, UdpEndpoint, UdpEvents,
};

struct Quit;
impl PumpMessage for Quit {
    fn is_quit(&self) -> bool {
        true
    }
}

struct SilentReactor;
impl ReactorEvents<Quit> for SilentReactor {}

struct Collector(mpsc::Sender<(Address, Vec<u8>)>);
impl UdpEvents for Collector {
    fn on_datagram(&self, _endpoint: &UdpEndpoint, from: &Address, data: &[u8]) {
        let _ = self.0.send((*from, data.to_vec()));
    }
}

fn bound_endpoint(
    reactor: &Arc<Reactor<Quit>>,
) -> (Arc<UdpEndpoint>, mpsc::Receiver<(Address, Vec<u8>)>, Address) {
    let (tx, rx) = mpsc::channel();
    let endpoint = UdpEndpoint::new(&reactor.handle(), 1 << 16, Box::new(Collector(tx)));
    endpoint.bind_port(0).unwrap();
    let addr = Address::parse("::1", endpoint.local().port()).unwrap();
    (endpoint, rx, addr)
}

#[test]
fn datagram_boundaries_survive() {
    let reactor: Arc<Reactor<Quit>> = Arc::new(Reactor::new(Box::new(SilentReactor)).unwrap());
    let worker = {
        let reactor = Arc::clone(&reactor);
        thread::spawn(move || reactor.run().unwrap())
    };

    let (sender, sender_rx, sender_addr) = bound_endpoint(&reactor);
    let (receiver_a, a_rx, a_addr) = bound_endpoint(&reactor);
    let (_receiver_b, b_rx, b_addr) = bound_endpoint(&reactor);

    // One datagram per write, each to its own peer.
    sender.write(&a_addr, b"hello").unwrap();
    sender.write(&b_addr, b"world").unwrap();

    let (from, data) = a_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(data, b"hello");
    assert_eq!(from.port(), sender_addr.port());
    let (_, data) = b_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(data, b"world");

    // Neither receiver sees more than its single datagram.
    assert!(a_rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(b_rx.recv_timeout(Duration::from_millis(200)).is_err());

    // Two inbound datagrams of 3 and 5 bytes surface as exactly two
    // callbacks with those lengths.
    receiver_a.write(&sender_addr, b"abc").unwrap();
    receiver_a.write(&sender_addr, b"fghij").unwrap();

    let (_, first) = sender_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let (_, second) = sender_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(second.len(), 5);
    assert_eq!(first, b"abc");
    assert_eq!(second, b"fghij");
    assert!(sender_rx.recv_timeout(Duration::from_millis(200)).is_err());

    reactor.post(Quit).unwrap();
    worker.join().unwrap();
}

#[test]
fn double_bind_is_rejected() {
    let reactor: Arc<Reactor<Quit>> = Arc::new(Reactor::new(Box::new(SilentReactor)).unwrap());
    let worker = {
        let reactor = Arc::clone(&reactor);
        thread::spawn(move || reactor.run().unwrap())
    };

    let (endpoint, _rx, _addr) = bound_endpoint(&reactor);
    let err = endpoint.bind_port(0).unwrap_err();
    assert!(matches!(
        err,
        reflex_net::Error::Udp(reflex_net::error::UdpError::AlreadyBound)
    ));

    reactor.post(Quit).unwrap();
    worker.join().unwrap();
}
