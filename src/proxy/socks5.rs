//! SOCKS5 wire codec (RFC 1928 subset).
//!
//! ```text
//! greeting:  VER | NMETHODS | METHODS
//! request:   VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT
//! reply:     VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
//! ```
//!
//! Parsers take the bytes buffered so far and return `Ok(None)` until a
//! complete unit is available, then the unit and the number of bytes it
//! occupied.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

/// Protocol version byte.
pub const SOCKS_VERSION: u8 = 0x05;

/// "No authentication required" method.
pub const METHOD_NO_AUTH: u8 = 0x00;
/// "No acceptable methods" selection.
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// CONNECT command.
pub const CMD_CONNECT: u8 = 0x01;
/// BIND command (rejected).
pub const CMD_BIND: u8 = 0x02;
/// UDP ASSOCIATE command (rejected).
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// IPv4 address type.
pub const ATYP_IPV4: u8 = 0x01;
/// Domain name address type.
pub const ATYP_DOMAIN: u8 = 0x03;
/// IPv6 address type.
pub const ATYP_IPV6: u8 = 0x04;

/// Selection reply for a no-auth session.
pub const NO_AUTH_SELECTION: [u8; 2] = [SOCKS_VERSION, METHOD_NO_AUTH];

/// Methods the local agent offers on the tunnel before its forwarded request.
pub const TUNNEL_METHODS: [u8; 1] = [METHOD_NO_AUTH];

/// Reply status codes.
pub mod reply {
    use std::io;

    /// Connection established
    pub const SUCCEEDED: u8 = 0x00;
    /// General SOCKS server failure
    pub const GENERAL_FAILURE: u8 = 0x01;
    /// Connection not allowed by ruleset
    pub const CONNECTION_NOT_ALLOWED: u8 = 0x02;
    /// Network unreachable
    pub const NETWORK_UNREACHABLE: u8 = 0x03;
    /// Host unreachable
    pub const HOST_UNREACHABLE: u8 = 0x04;
    /// Connection refused
    pub const CONNECTION_REFUSED: u8 = 0x05;
    /// TTL expired
    pub const TTL_EXPIRED: u8 = 0x06;
    /// Command not supported
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
    /// Address type not supported
    pub const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

    /// Map a dial failure onto the closest reply status.
    pub fn code_for_io_error(err: &io::Error) -> u8 {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => CONNECTION_REFUSED,
            io::ErrorKind::PermissionDenied => CONNECTION_NOT_ALLOWED,
            io::ErrorKind::AddrNotAvailable => NETWORK_UNREACHABLE,
            io::ErrorKind::TimedOut | io::ErrorKind::NotFound => HOST_UNREACHABLE,
            _ => GENERAL_FAILURE,
        }
    }
}

/// Destination of a CONNECT request, or the bound address of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// Literal IPv4 or IPv6 address
    Ip(SocketAddr),
    /// Domain name resolved by the dialing side
    Domain(String, u16),
}

impl TargetAddr {
    /// Port component.
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Append the ATYP, address and port encoding.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&addr.ip().octets());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&addr.ip().octets());
            }
            TargetAddr::Domain(host, _) => {
                let host = &host.as_bytes()[..host.len().min(255)];
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(host.len() as u8);
                buf.put_slice(host);
            }
        }
        buf.put_u16(self.port());
    }

    /// Synchronously connect to this target, trying each resolved address.
    pub fn dial(&self, timeout: Option<Duration>) -> io::Result<TcpStream> {
        let addrs: Vec<SocketAddr> = match self {
            TargetAddr::Ip(addr) => vec![*addr],
            TargetAddr::Domain(host, port) => (host.as_str(), *port).to_socket_addrs()?.collect(),
        };

        let mut last_err = None;
        for addr in addrs {
            let attempt = match timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{} resolved to no addresses", self))
        }))
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

/// Method negotiation header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    /// Authentication methods offered by the client
    pub methods: Vec<u8>,
}

impl Greeting {
    /// Whether the client offered "no authentication required".
    pub fn offers_no_auth(&self) -> bool {
        self.methods.contains(&METHOD_NO_AUTH)
    }
}

/// Connect request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// `CMD_*` code
    pub command: u8,
    /// Address the client wants reached
    pub target: TargetAddr,
}

/// Connect reply header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// `reply::*` status code
    pub status: u8,
    /// Address the server bound for the outgoing connection
    pub bound: TargetAddr,
}

fn check_version(actual: u8) -> Result<()> {
    if actual != SOCKS_VERSION {
        return Err(Error::VersionMismatch {
            expected: SOCKS_VERSION,
            actual,
        });
    }
    Ok(())
}

/// Parse a greeting.
pub fn parse_greeting(buf: &[u8]) -> Result<Option<(Greeting, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    check_version(buf[0])?;
    if buf.len() < 2 {
        return Ok(None);
    }

    let n_methods = buf[1] as usize;
    if n_methods == 0 {
        return Err(Error::protocol("empty method list"));
    }
    if buf.len() < 2 + n_methods {
        return Ok(None);
    }

    let greeting = Greeting {
        methods: buf[2..2 + n_methods].to_vec(),
    };
    Ok(Some((greeting, 2 + n_methods)))
}

/// Parse a method selection (the server's answer to a greeting).
pub fn parse_selection(buf: &[u8]) -> Result<Option<(u8, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    check_version(buf[0])?;
    Ok(Some((buf[1], 2)))
}

/// Parse a connect request.
///
/// The command byte is returned as-is; rejecting non-CONNECT commands is the
/// caller's decision so it can still answer with a reply.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Request, usize)>> {
    match parse_header(buf)? {
        Some((command, target, len)) => Ok(Some((Request { command, target }, len))),
        None => Ok(None),
    }
}

/// Parse a connect reply.
pub fn parse_reply(buf: &[u8]) -> Result<Option<(Reply, usize)>> {
    match parse_header(buf)? {
        Some((status, bound, len)) => Ok(Some((Reply { status, bound }, len))),
        None => Ok(None),
    }
}

// Requests and replies share one layout; only the meaning of byte 1 differs.
fn parse_header(buf: &[u8]) -> Result<Option<(u8, TargetAddr, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    check_version(buf[0])?;
    if buf.len() < 4 {
        return Ok(None);
    }

    let code = buf[1];
    let atyp = buf[3];
    let body = &buf[4..];

    let (target, addr_len) = match atyp {
        ATYP_IPV4 => {
            if body.len() < 4 + 2 {
                return Ok(None);
            }
            let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let port = u16::from_be_bytes([body[4], body[5]]);
            (TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 4 + 2)
        }
        ATYP_DOMAIN => {
            if body.is_empty() {
                return Ok(None);
            }
            let domain_len = body[0] as usize;
            if domain_len == 0 {
                return Err(Error::protocol("empty domain name"));
            }
            if body.len() < 1 + domain_len + 2 {
                return Ok(None);
            }
            let domain = String::from_utf8_lossy(&body[1..1 + domain_len]).to_string();
            let port = u16::from_be_bytes([body[1 + domain_len], body[2 + domain_len]]);
            (TargetAddr::Domain(domain, port), 1 + domain_len + 2)
        }
        ATYP_IPV6 => {
            if body.len() < 16 + 2 {
                return Ok(None);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&body[..16]);
            let port = u16::from_be_bytes([body[16], body[17]]);
            (
                TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                16 + 2,
            )
        }
        other => return Err(Error::UnsupportedAddressType(other)),
    };

    Ok(Some((code, target, 4 + addr_len)))
}

/// Append a greeting offering `methods`.
pub fn encode_greeting(methods: &[u8], buf: &mut BytesMut) {
    buf.put_u8(SOCKS_VERSION);
    buf.put_u8(methods.len() as u8);
    buf.put_slice(methods);
}

/// Append a connect request.
pub fn encode_request(command: u8, target: &TargetAddr, buf: &mut BytesMut) {
    buf.put_slice(&[SOCKS_VERSION, command, 0x00]);
    target.encode(buf);
}

/// Append a connect reply. Failure replies carry `0.0.0.0:0` when no bound
/// address is known.
pub fn encode_reply(status: u8, bound: Option<SocketAddr>, buf: &mut BytesMut) {
    let bound = bound.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    buf.put_slice(&[SOCKS_VERSION, status, 0x00]);
    TargetAddr::Ip(bound).encode(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_partial_then_complete() {
        assert!(parse_greeting(&[]).unwrap().is_none());
        assert!(parse_greeting(&[0x05]).unwrap().is_none());
        assert!(parse_greeting(&[0x05, 0x02, 0x00]).unwrap().is_none());

        let (greeting, used) = parse_greeting(&[0x05, 0x02, 0x02, 0x00, 0xAA]).unwrap().unwrap();
        assert_eq!(used, 4);
        assert_eq!(greeting.methods, vec![0x02, 0x00]);
        assert!(greeting.offers_no_auth());
    }

    #[test]
    fn test_tunnel_greeting_encoding() {
        let mut buf = BytesMut::new();
        encode_greeting(&TUNNEL_METHODS, &mut buf);
        assert_eq!(&buf[..], &[0x05, 0x01, 0x00]);

        let (greeting, used) = parse_greeting(&buf).unwrap().unwrap();
        assert_eq!(used, 3);
        assert!(greeting.offers_no_auth());
    }

    #[test]
    fn test_greeting_rejects_bad_version_and_empty_methods() {
        assert!(matches!(
            parse_greeting(&[0x04, 0x01, 0x00]),
            Err(Error::VersionMismatch { actual: 0x04, .. })
        ));
        assert!(matches!(parse_greeting(&[0x05, 0x00]), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_parse_ipv4_request() {
        let buf = [0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xBB];
        let (req, used) = parse_request(&buf).unwrap().unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(req.command, CMD_CONNECT);
        assert_eq!(req.target, TargetAddr::Ip("93.184.216.34:443".parse().unwrap()));
    }

    #[test]
    fn test_parse_domain_request_in_pieces() {
        let mut buf = vec![0x05, 0x01, 0x00, 0x03, 11];
        buf.extend_from_slice(b"example.org");
        buf.extend_from_slice(&80u16.to_be_bytes());

        for cut in 0..buf.len() {
            assert!(parse_request(&buf[..cut]).unwrap().is_none(), "cut at {}", cut);
        }

        let (req, used) = parse_request(&buf).unwrap().unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(req.target, TargetAddr::Domain("example.org".into(), 80));
        assert_eq!(req.target.to_string(), "example.org:80");
    }

    #[test]
    fn test_parse_ipv6_request() {
        let target = TargetAddr::Ip("[2001:db8::1]:8080".parse().unwrap());
        let mut buf = BytesMut::new();
        encode_request(CMD_CONNECT, &target, &mut buf);
        assert_eq!(buf.len(), 4 + 16 + 2);

        let (req, _) = parse_request(&buf).unwrap().unwrap();
        assert_eq!(req.target, target);
    }

    #[test]
    fn test_unknown_address_type() {
        let buf = [0x05, 0x01, 0x00, 0x09, 0, 0];
        assert!(matches!(parse_request(&buf), Err(Error::UnsupportedAddressType(0x09))));
    }

    #[test]
    fn test_bind_command_is_parsed_not_rejected() {
        let buf = [0x05, CMD_BIND, 0x00, 0x01, 127, 0, 0, 1, 0, 80];
        let (req, _) = parse_request(&buf).unwrap().unwrap();
        assert_eq!(req.command, CMD_BIND);
    }

    #[test]
    fn test_reply_encoding() {
        let mut buf = BytesMut::new();
        encode_reply(reply::SUCCEEDED, Some("10.0.0.2:5555".parse().unwrap()), &mut buf);
        assert_eq!(&buf[..], &[0x05, 0x00, 0x00, 0x01, 10, 0, 0, 2, 0x15, 0xB3]);

        buf.clear();
        encode_reply(reply::CONNECTION_REFUSED, None, &mut buf);
        assert_eq!(&buf[..], &[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        let (parsed, used) = parse_reply(&buf).unwrap().unwrap();
        assert_eq!(used, 10);
        assert_eq!(parsed.status, reply::CONNECTION_REFUSED);
    }

    #[test]
    fn test_selection() {
        assert!(parse_selection(&[0x05]).unwrap().is_none());
        assert_eq!(parse_selection(&NO_AUTH_SELECTION).unwrap(), Some((METHOD_NO_AUTH, 2)));
        assert!(parse_selection(&[0x04, 0x00]).is_err());
    }

    #[test]
    fn test_io_error_mapping() {
        let code = |kind| reply::code_for_io_error(&io::Error::from(kind));
        assert_eq!(code(io::ErrorKind::ConnectionRefused), reply::CONNECTION_REFUSED);
        assert_eq!(code(io::ErrorKind::TimedOut), reply::HOST_UNREACHABLE);
        assert_eq!(code(io::ErrorKind::Other), reply::GENERAL_FAILURE);
    }

    #[test]
    fn test_dial_refused() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let target = TargetAddr::Domain("127.0.0.1".into(), port);
        let err = target.dial(Some(Duration::from_secs(2))).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
