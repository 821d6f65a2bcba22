use std::io;

use thiserror::Error;

pub use reflex_buffer::RingError;

#[derive(Error, Debug)]
#[repr(u8)]
pub enum AddressError {
    #[error("unknown address type")]
    UnknownAddressType,
    #[error("address is not an IPv4 endpoint")]
    NotIpv4,
    #[error("address is not an IPv6 endpoint")]
    NotIpv6,
    #[error("undefined address family")]
    UndefinedFamily,
}

/// Failures of the shared endpoint plumbing.
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("error creating socket")]
    UnableToCreateSocket(#[source] io::Error),
    #[error("error fetching the socket name")]
    GetPeerName(#[source] io::Error),
}

#[derive(Error, Debug)]
pub enum TalkerError {
    #[error("remote address is not an IPv4 or IPv6 endpoint")]
    InvalidRemoteAddress,
    #[error("unable to connect")]
    UnableToConnect(#[source] io::Error),
    #[error("error receiving stream data")]
    UnableToRecvData(#[source] io::Error),
    #[error("invalid state while sending: {0}")]
    InvalidSendState(&'static str),
    #[error("short read of the queued packet length: expected {expected} bytes, read {read}")]
    ReadingWritePacketLength { expected: usize, read: usize },
    #[error("error sending stream data")]
    SendingPacket(#[source] io::Error),
}

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("error binding listening socket")]
    UnableToBindSocket(#[source] io::Error),
    #[error("error entering the listening state")]
    UnableToListen(#[source] io::Error),
    #[error("error accepting a new connection")]
    UnableToAcceptSocket(#[source] io::Error),
}

#[derive(Error, Debug)]
pub enum UdpError {
    #[error("socket is already bound")]
    AlreadyBound,
    #[error("error binding socket")]
    UnableToBindSocket(#[source] io::Error),
    #[error("error receiving a datagram")]
    UnableToRecvData(#[source] io::Error),
    #[error("error sending a datagram")]
    SendingPacket(#[source] io::Error),
    #[error("short read of the queued record header: expected {expected} bytes, read {read}")]
    ReadingWritePacketLength { expected: usize, read: usize },
}

/// Failures of the reactor's wake channel.
#[derive(Error, Debug)]
pub enum PipeError {
    #[error("error opening the wake pipe")]
    UnableToOpenPipe(#[source] io::Error),
    #[error("error reading the wake pipe")]
    UnableToReadPipe(#[source] io::Error),
    #[error("error writing the wake pipe")]
    UnableToWritePipe(#[source] io::Error),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Talker(#[from] TalkerError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Udp(#[from] UdpError),
    #[error(transparent)]
    Pipe(#[from] PipeError),
}

pub type Result<T> = std::result::Result<T, Error>;
