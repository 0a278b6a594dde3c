//! SOCKS5 negotiation (RFC 1928)

use super::ProxyError;
use crate::protocol::{Address, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// CONNECT command
const CMD_CONNECT: u8 = 0x01;

/// Reply codes
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum Reply {
    Succeeded = 0x00,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Run the client-facing SOCKS5 handshake and request parse.
///
/// Replies are written here as well: the no-auth method selection, the
/// error reply on unsupported commands or address types, and on success the
/// zeroed BND reply (`0.0.0.0:0`): the client never learns the real
/// egress address, the remote side dials on its behalf.
pub async fn negotiate_socks5<S>(stream: &mut S) -> Result<Address, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: VER, NMETHODS, methods
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;

    if head[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(head[0]));
    }

    let nmethods = head[1] as usize;
    let mut methods = [0u8; 255];
    stream.read_exact(&mut methods[..nmethods]).await?;

    // Select no-auth unconditionally
    stream.write_all(&[SOCKS_VERSION, 0x00]).await?;

    // Request: VER, CMD, RSV, ATYP
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;

    if request[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(request[0]));
    }

    if request[1] != CMD_CONNECT {
        // BIND and UDP ASSOCIATE always get the explicit error reply.
        send_reply(stream, Reply::CommandNotSupported).await?;
        return Err(ProxyError::UnsupportedCommand(request[1]));
    }

    let address = match request[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            Address::Ipv4(Ipv4Addr::from(octets), port)
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            if len == 0 {
                send_reply(stream, Reply::AddressTypeNotSupported).await?;
                return Err(ProxyError::MalformedRequest("zero-length hostname".into()));
            }
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let domain = String::from_utf8(name)
                .map_err(|_| ProxyError::MalformedRequest("hostname is not UTF-8".into()))?;
            let port = stream.read_u16().await?;
            Address::Domain(domain, port)
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            Address::Ipv6(Ipv6Addr::from(octets), port)
        }
        other => {
            send_reply(stream, Reply::AddressTypeNotSupported).await?;
            return Err(ProxyError::UnsupportedAddrType(other));
        }
    };

    debug!("SOCKS5 CONNECT to {}", address);

    send_reply(stream, Reply::Succeeded).await?;

    Ok(address)
}

/// Reply with a zeroed IPv4 BND address: VER, REP, RSV, ATYP, 0.0.0.0, 0.
async fn send_reply<S>(stream: &mut S, reply: Reply) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[
            SOCKS_VERSION,
            reply as u8,
            0x00,
            ATYP_IPV4,
            0,
            0,
            0,
            0,
            0,
            0,
        ])
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive the negotiator with scripted client bytes over an in-memory
    /// duplex; returns the result plus everything the negotiator wrote.
    async fn run_script(client_bytes: &[u8]) -> (Result<Address, ProxyError>, Vec<u8>) {
        let (mut server_side, mut client_side) = tokio::io::duplex(1024);
        client_side.write_all(client_bytes).await.unwrap();

        let result = negotiate_socks5(&mut server_side).await;

        let mut written = Vec::new();
        drop(server_side);
        client_side.read_to_end(&mut written).await.unwrap();
        (result, written)
    }

    #[tokio::test]
    async fn test_ipv4_connect() {
        let mut script = vec![0x05, 0x01, 0x00]; // greeting: no-auth only
        script.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50]);

        let (result, written) = run_script(&script).await;
        assert_eq!(
            result.unwrap(),
            Address::Ipv4(Ipv4Addr::new(1, 2, 3, 4), 80)
        );
        assert_eq!(&written[..2], &[0x05, 0x00]);
        assert_eq!(
            &written[2..],
            &[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
    }

    #[tokio::test]
    async fn test_hostname_connect() {
        let mut script = vec![0x05, 0x02, 0x00, 0x02]; // two offered methods
        script.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, 0x0b]);
        script.extend_from_slice(b"example.com");
        script.extend_from_slice(&[0x01, 0xbb]);

        let (result, _) = run_script(&script).await;
        assert_eq!(
            result.unwrap(),
            Address::Domain("example.com".into(), 443)
        );
    }

    #[tokio::test]
    async fn test_ipv6_connect() {
        let mut script = vec![0x05, 0x01, 0x00];
        script.extend_from_slice(&[0x05, 0x01, 0x00, 0x04]);
        script.extend_from_slice(&[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        script.extend_from_slice(&[0x1f, 0x90]);

        let (result, _) = run_script(&script).await;
        assert_eq!(
            result.unwrap(),
            Address::Ipv6("2001:db8::1".parse().unwrap(), 8080)
        );
    }

    #[tokio::test]
    async fn test_bind_gets_command_not_supported() {
        let mut script = vec![0x05, 0x01, 0x00];
        script.extend_from_slice(&[0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        let (result, written) = run_script(&script).await;
        assert!(matches!(result, Err(ProxyError::UnsupportedCommand(0x02))));
        assert_eq!(written[2..4], [0x05, 0x07]);
    }

    #[tokio::test]
    async fn test_unknown_addr_type_rejected() {
        let mut script = vec![0x05, 0x01, 0x00];
        script.extend_from_slice(&[0x05, 0x01, 0x00, 0x05]);

        let (result, written) = run_script(&script).await;
        assert!(matches!(result, Err(ProxyError::UnsupportedAddrType(0x05))));
        assert_eq!(written[2..4], [0x05, 0x08]);
    }

    #[tokio::test]
    async fn test_zero_length_hostname_rejected() {
        let mut script = vec![0x05, 0x01, 0x00];
        script.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, 0x00, 0x00, 0x50]);

        let (result, _) = run_script(&script).await;
        assert!(matches!(result, Err(ProxyError::MalformedRequest(_))));
    }

    #[tokio::test]
    async fn test_max_length_hostname_accepted() {
        let name = "a".repeat(255);
        let mut script = vec![0x05, 0x01, 0x00];
        script.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, 0xff]);
        script.extend_from_slice(name.as_bytes());
        script.extend_from_slice(&[0x00, 0x50]);

        let (result, _) = run_script(&script).await;
        assert_eq!(result.unwrap(), Address::Domain(name, 80));
    }

    #[tokio::test]
    async fn test_wrong_version_rejected() {
        let (result, _) = run_script(&[0x04, 0x01, 0x00]).await;
        assert!(matches!(result, Err(ProxyError::InvalidSocksVersion(0x04))));
    }
}
