use std::{
    io::Read,
    net::TcpStream,
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use reflex_net::{
    PumpMessage, Reactor, ReactorEvents, ReactorHandle,
    tcp::{ListenState, ListenerEvents, TcpListener, TcpTalker},
};

struct Quit;
impl PumpMessage for Quit {
    fn is_quit(&self) -> bool {
        true
    }
}

struct SilentReactor;
impl ReactorEvents<Quit> for SilentReactor {}

/// Refuses every connection, reporting each refusal to the test.
struct RefuseAll(mpsc::Sender<()>);
impl ListenerEvents for RefuseAll {
    fn create_talker(&self, _reactor: &ReactorHandle) -> Option<Arc<TcpTalker>> {
        let _ = self.0.send(());
        None
    }
}

#[test]
fn refused_connection_is_closed_immediately() {
    let reactor: Arc<Reactor<Quit>> = Arc::new(Reactor::new(Box::new(SilentReactor)).unwrap());
    let worker = {
        let reactor = Arc::clone(&reactor);
        thread::spawn(move || reactor.run().unwrap())
    };

    let (refused_tx, refused_rx) = mpsc::channel();
    let listener = TcpListener::new(&reactor.handle(), Box::new(RefuseAll(refused_tx)));
    listener.listen_port(0, 4).unwrap();
    assert_eq!(listener.state(), ListenState::Listening);
    let port = listener.local().port();

    let mut stream = TcpStream::connect(("::1", port)).unwrap();
    refused_rx.recv_timeout(Duration::from_secs(5)).expect("factory was never consulted");

    // The accepted handle was closed on the spot: the peer observes either
    // a clean end of stream or a reset, never data.
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 1];
    match stream.read(&mut buf) {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("refused connection delivered {n} bytes"),
    }

    // The listener shrugs it off and keeps listening.
    assert_eq!(listener.state(), ListenState::Listening);
    assert_eq!(reactor.endpoint_count(), 1);

    reactor.post(Quit).unwrap();
    worker.join().unwrap();
}
