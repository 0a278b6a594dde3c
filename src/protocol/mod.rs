//! Destination address header codec
//!
//! The first plaintext bytes the local side sends through a fresh tunnel
//! (right after the IV, encrypted like everything else) describe where the
//! remote side should dial:
//!
//! ```text
//! +------+----------+--------+
//! | ATYP |   addr   |  port  |
//! +------+----------+--------+
//!   0x01   4B IPv4     2B BE
//!   0x03   1B len + hostname
//!   0x04   16B IPv6
//! ```
//!
//! The remote side decodes this header before dialling; a header that does
//! not parse is the signal that the peer does not hold the password.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Address type tag: IPv4
pub const ATYP_IPV4: u8 = 0x01;
/// Address type tag: hostname
pub const ATYP_DOMAIN: u8 = 0x03;
/// Address type tag: IPv6
pub const ATYP_IPV6: u8 = 0x04;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad address header: {0}")]
    BadHeader(String),

    #[error("Hostname too long: {0} bytes")]
    HostnameTooLong(usize),
}

/// A dial target: what the client asked for, carried verbatim to the
/// remote side so name resolution happens at the egress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl Address {
    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Host part without the port
    pub fn host(&self) -> String {
        match self {
            Address::Ipv4(ip, _) => ip.to_string(),
            Address::Ipv6(ip, _) => ip.to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Parse a `host:port` string (with `[v6]:port` bracket form), falling
    /// back to `default_port` when no port is present.
    pub fn parse(target: &str, default_port: u16) -> Result<Self, ProtocolError> {
        let (host, port) = match target.rsplit_once(':') {
            // The last colon of a bare IPv6 literal is not a port
            // separator; only split when the host part is bracketed or
            // colon-free and the port parses.
            Some((host, port_str))
                if !host.is_empty() && (host.starts_with('[') || !host.contains(':')) =>
            {
                match port_str.parse::<u16>() {
                    Ok(port) => (host, port),
                    Err(_) => (target, default_port),
                }
            }
            _ => (target, default_port),
        };

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if host.is_empty() {
            return Err(ProtocolError::BadHeader("empty host".into()));
        }

        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            Ok(Address::Ipv4(ip, port))
        } else if let Ok(ip) = host.parse::<Ipv6Addr>() {
            Ok(Address::Ipv6(ip, port))
        } else {
            Ok(Address::Domain(host.to_string(), port))
        }
    }

    /// Encode the wire header
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(1 + 16 + 2);
        match self {
            Address::Ipv4(ip, port) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&ip.octets());
                buf.put_u16(*port);
            }
            Address::Domain(domain, port) => {
                if domain.is_empty() {
                    return Err(ProtocolError::BadHeader("empty hostname".into()));
                }
                if domain.len() > 255 {
                    return Err(ProtocolError::HostnameTooLong(domain.len()));
                }
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
            Address::Ipv6(ip, port) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&ip.octets());
                buf.put_u16(*port);
            }
        }
        Ok(buf.freeze())
    }

    /// Decode a wire header from the (already decrypting) stream.
    ///
    /// A tag outside the three known ATYPs or a zero-length hostname means
    /// the bytes did not decrypt to a header at all.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, ProtocolError> {
        let atyp = r.read_u8().await?;
        let addr = match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                r.read_exact(&mut octets).await?;
                let port = r.read_u16().await?;
                Address::Ipv4(Ipv4Addr::from(octets), port)
            }
            ATYP_DOMAIN => {
                let len = r.read_u8().await? as usize;
                if len == 0 {
                    return Err(ProtocolError::BadHeader("zero-length hostname".into()));
                }
                let mut name = vec![0u8; len];
                r.read_exact(&mut name).await?;
                let domain = String::from_utf8(name)
                    .map_err(|_| ProtocolError::BadHeader("hostname is not UTF-8".into()))?;
                let port = r.read_u16().await?;
                Address::Domain(domain, port)
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                r.read_exact(&mut octets).await?;
                let port = r.read_u16().await?;
                Address::Ipv6(Ipv6Addr::from(octets), port)
            }
            other => {
                return Err(ProtocolError::BadHeader(format!(
                    "unknown address type: {:#04x}",
                    other
                )))
            }
        };
        Ok(addr)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            Address::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::Ipv4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => Address::Ipv6(*v6.ip(), v6.port()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode(bytes: &[u8]) -> Result<Address, ProtocolError> {
        let mut cursor = bytes;
        Address::read_from(&mut cursor).await
    }

    #[tokio::test]
    async fn test_ipv4_wire_layout() {
        let addr = Address::Ipv4(Ipv4Addr::new(1, 2, 3, 4), 80);
        let encoded = addr.encode().unwrap();
        assert_eq!(&encoded[..], &[0x01, 1, 2, 3, 4, 0x00, 0x50]);
        assert_eq!(decode(&encoded).await.unwrap(), addr);
    }

    #[tokio::test]
    async fn test_domain_wire_layout() {
        let addr = Address::Domain("example.com".to_string(), 443);
        let encoded = addr.encode().unwrap();
        let mut expected = vec![0x03, 0x0b];
        expected.extend_from_slice(b"example.com");
        expected.extend_from_slice(&[0x01, 0xbb]);
        assert_eq!(&encoded[..], &expected[..]);
        assert_eq!(decode(&encoded).await.unwrap(), addr);
    }

    #[tokio::test]
    async fn test_ipv6_round_trip() {
        let addr = Address::Ipv6("2001:db8::1".parse().unwrap(), 8080);
        let encoded = addr.encode().unwrap();
        assert_eq!(encoded.len(), 1 + 16 + 2);
        assert_eq!(decode(&encoded).await.unwrap(), addr);
    }

    #[tokio::test]
    async fn test_max_length_hostname() {
        let addr = Address::Domain("a".repeat(255), 1);
        let encoded = addr.encode().unwrap();
        assert_eq!(decode(&encoded).await.unwrap(), addr);

        let too_long = Address::Domain("a".repeat(256), 1);
        assert!(matches!(
            too_long.encode(),
            Err(ProtocolError::HostnameTooLong(256))
        ));
    }

    #[tokio::test]
    async fn test_garbage_rejected() {
        // Unknown ATYP
        assert!(matches!(
            decode(&[0x7f, 0, 0]).await,
            Err(ProtocolError::BadHeader(_))
        ));
        // Zero-length hostname
        assert!(matches!(
            decode(&[0x03, 0x00, 0x00, 0x50]).await,
            Err(ProtocolError::BadHeader(_))
        ));
        // Truncated IPv4
        assert!(matches!(
            decode(&[0x01, 1, 2]).await,
            Err(ProtocolError::Io(_))
        ));
    }

    #[test]
    fn test_parse_target_forms() {
        assert_eq!(
            Address::parse("example.com:443", 80).unwrap(),
            Address::Domain("example.com".into(), 443)
        );
        assert_eq!(
            Address::parse("example.com", 80).unwrap(),
            Address::Domain("example.com".into(), 80)
        );
        assert_eq!(
            Address::parse("10.0.0.1:8388", 80).unwrap(),
            Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1), 8388)
        );
        assert_eq!(
            Address::parse("[2001:db8::1]:443", 80).unwrap(),
            Address::Ipv6("2001:db8::1".parse().unwrap(), 443)
        );
        assert_eq!(
            Address::parse("::1", 80).unwrap(),
            Address::Ipv6("::1".parse().unwrap(), 80)
        );
        assert!(Address::parse("", 80).is_err());
    }
}
