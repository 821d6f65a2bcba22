use std::{
    fmt, mem,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::error::AddressError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[repr(u8)]
pub enum Family {
    V4,
    V6,
    #[default]
    Undefined,
}

/// An IPv4 or IPv6 endpoint (numeric address plus port), or nothing at all.
///
/// Freely copied value type. An `Undefined` address is what endpoints carry
/// before they are bound or connected; converting one to a kernel address
/// fails with [`AddressError::UndefinedFamily`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    inner: Option<SocketAddr>,
}

/// Width of the fixed in-ring encoding: family tag, port, 16 address bytes.
pub(crate) const ENCODED_LEN: usize = 1 + 2 + 16;

impl Address {
    /// Parses a presentation-form numeric address, trying IPv4 first and
    /// then IPv6.
    pub fn parse(addr: &str, port: u16) -> Result<Self, AddressError> {
        if let Ok(v4) = Ipv4Addr::from_str(addr) {
            return Ok(Self::from(SocketAddr::V4(SocketAddrV4::new(v4, port))));
        }
        if let Ok(v6) = Ipv6Addr::from_str(addr) {
            return Ok(Self::from(SocketAddr::V6(SocketAddrV6::new(v6, port, 0, 0))));
        }
        Err(AddressError::UnknownAddressType)
    }

    /// The IPv6 wildcard bound on `port`, for endpoints that listen or bind
    /// on any address.
    pub fn any(port: u16) -> Self {
        Self::from(SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0)))
    }

    pub fn family(&self) -> Family {
        match self.inner {
            Some(SocketAddr::V4(_)) => Family::V4,
            Some(SocketAddr::V6(_)) => Family::V6,
            None => Family::Undefined,
        }
    }

    pub fn port(&self) -> u16 {
        self.inner.map_or(0, |a| a.port())
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.inner
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.inner.map(|a| a.ip())
    }

    pub fn clear(&mut self) {
        self.inner = None;
    }

    pub fn as_v4(&self) -> Result<SocketAddrV4, AddressError> {
        match self.inner {
            Some(SocketAddr::V4(v4)) => Ok(v4),
            _ => Err(AddressError::NotIpv4),
        }
    }

    pub fn as_v6(&self) -> Result<SocketAddrV6, AddressError> {
        match self.inner {
            Some(SocketAddr::V6(v6)) => Ok(v6),
            _ => Err(AddressError::NotIpv6),
        }
    }

    /// Converts to the kernel representation for bind/connect/sendto.
    pub(crate) fn to_raw(
        self,
    ) -> Result<(libc::sockaddr_storage, libc::socklen_t), AddressError> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        match self.inner {
            Some(SocketAddr::V4(v4)) => {
                let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
                unsafe {
                    (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                    (*sin).sin_port = v4.port().to_be();
                    (*sin).sin_addr.s_addr = u32::from(*v4.ip()).to_be();
                }
                Ok((storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t))
            }
            Some(SocketAddr::V6(v6)) => {
                let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
                unsafe {
                    (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    (*sin6).sin6_port = v6.port().to_be();
                    (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                    (*sin6).sin6_flowinfo = v6.flowinfo();
                    (*sin6).sin6_scope_id = v6.scope_id();
                }
                Ok((storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t))
            }
            None => Err(AddressError::UndefinedFamily),
        }
    }

    /// Builds an address from a kernel structure of either family. Anything
    /// else comes back `Undefined`.
    pub(crate) fn from_raw(storage: &libc::sockaddr_storage) -> Self {
        match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                Self::from(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Self::from(SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => Self::default(),
        }
    }

    /// Fixed-width encoding used inside datagram ring records.
    pub(crate) fn encode(&self) -> [u8; ENCODED_LEN] {
        let mut buf = [0u8; ENCODED_LEN];
        match self.inner {
            Some(SocketAddr::V4(v4)) => {
                buf[0] = 4;
                buf[1..3].copy_from_slice(&v4.port().to_ne_bytes());
                buf[3..7].copy_from_slice(&v4.ip().octets());
            }
            Some(SocketAddr::V6(v6)) => {
                buf[0] = 6;
                buf[1..3].copy_from_slice(&v6.port().to_ne_bytes());
                buf[3..19].copy_from_slice(&v6.ip().octets());
            }
            None => {}
        }
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self, AddressError> {
        debug_assert!(buf.len() >= ENCODED_LEN);
        let port = u16::from_ne_bytes([buf[1], buf[2]]);
        match buf[0] {
            4 => {
                let ip = Ipv4Addr::new(buf[3], buf[4], buf[5], buf[6]);
                Ok(Self::from(SocketAddr::V4(SocketAddrV4::new(ip, port))))
            }
            6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[3..19]);
                Ok(Self::from(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    0,
                    0,
                ))))
            }
            0 => Ok(Self::default()),
            _ => Err(AddressError::UnknownAddressType),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self { inner: Some(addr) }
    }
}

impl From<Address> for Option<SocketAddr> {
    fn from(addr: Address) -> Self {
        addr.inner
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner {
            Some(addr) => addr.fmt(f),
            None => f.write_str("undefined"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v4_then_v6() {
        let a = Address::parse("127.0.0.1", 80).unwrap();
        assert_eq!(a.family(), Family::V4);
        assert_eq!(a.port(), 80);

        let b = Address::parse("::1", 8080).unwrap();
        assert_eq!(b.family(), Family::V6);

        assert!(matches!(
            Address::parse("not-an-address", 1),
            Err(AddressError::UnknownAddressType)
        ));
    }

    #[test]
    fn wildcard_is_v6() {
        let a = Address::any(5000);
        assert_eq!(a.family(), Family::V6);
        assert_eq!(a.port(), 5000);
        assert_eq!(a.as_v6().unwrap().ip(), &Ipv6Addr::UNSPECIFIED);
        assert!(a.as_v4().is_err());
    }

    #[test]
    fn raw_round_trip() {
        for addr in ["10.1.2.3", "fe80::1"] {
            let a = Address::parse(addr, 4321).unwrap();
            let (storage, _) = a.to_raw().unwrap();
            assert_eq!(Address::from_raw(&storage), a);
        }
        assert!(matches!(Address::default().to_raw(), Err(AddressError::UndefinedFamily)));
    }

    #[test]
    fn encoding_round_trip() {
        for addr in ["192.168.0.42", "2001:db8::7"] {
            let a = Address::parse(addr, 9999).unwrap();
            assert_eq!(Address::decode(&a.encode()).unwrap(), a);
        }
        let undefined = Address::default();
        assert_eq!(Address::decode(&undefined.encode()).unwrap(), undefined);
        let mut bad = [0u8; ENCODED_LEN];
        bad[0] = 9;
        assert!(matches!(Address::decode(&bad), Err(AddressError::UnknownAddressType)));
    }
}
