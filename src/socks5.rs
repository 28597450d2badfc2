use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};

pub const VERSION: u8 = 0x05;

const AUTH_NONE: u8 = 0x00;
const NO_ACCEPTABLE_METHODS: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Reply codes for the final CONNECT response.
pub mod reply {
    pub const SUCCESS: u8 = 0x00;
    pub const GENERAL_FAILURE: u8 = 0x01;
    pub const HOST_UNREACHABLE: u8 = 0x04;
    pub const CONNECTION_REFUSED: u8 = 0x05;
    pub const CMD_NOT_SUPPORTED: u8 = 0x07;
    pub const ADDR_NOT_SUPPORTED: u8 = 0x08;
}

/// Whole-handshake deadline; liveness probes and stalled clients give up here.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Socks5Error {
    /// Peer disconnected or the handshake deadline passed mid-read. Probe
    /// connections (bare connect-then-disconnect) land here and are not
    /// tunnel errors.
    #[error("handshake aborted")]
    Aborted,
    #[error("unsupported socks version {0:#04x}")]
    BadVersion(u8),
    #[error("client offered no acceptable authentication method")]
    NoAcceptableMethod,
    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),
}

/// Destination the client asked to CONNECT to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Request {
    pub host: String,
    pub port: u16,
}

/// Run the no-auth CONNECT handshake up to (but not including) the final
/// reply. The caller sends [`reply_success`] or [`reply_failure`] once it has
/// attempted to reach the destination.
pub async fn handshake<S>(stream: &mut S, limit: Duration) -> Result<Socks5Request, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = Instant::now() + limit;

    let mut head = [0u8; 2];
    read_exact_by(stream, &mut head, deadline).await?;
    if head[0] != VERSION {
        return Err(Socks5Error::BadVersion(head[0]));
    }
    let mut methods = vec![0u8; head[1] as usize];
    read_exact_by(stream, &mut methods, deadline).await?;
    if !methods.contains(&AUTH_NONE) {
        let _ = stream.write_all(&[VERSION, NO_ACCEPTABLE_METHODS]).await;
        return Err(Socks5Error::NoAcceptableMethod);
    }
    write_all_by(stream, &[VERSION, AUTH_NONE], deadline).await?;

    let mut request = [0u8; 4];
    read_exact_by(stream, &mut request, deadline).await?;
    if request[0] != VERSION {
        return Err(Socks5Error::BadVersion(request[0]));
    }
    if request[1] != CMD_CONNECT {
        let _ = write_reply(stream, reply::CMD_NOT_SUPPORTED).await;
        return Err(Socks5Error::UnsupportedCommand(request[1]));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            read_exact_by(stream, &mut addr, deadline).await?;
            Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            read_exact_by(stream, &mut len, deadline).await?;
            let mut name = vec![0u8; len[0] as usize];
            read_exact_by(stream, &mut name, deadline).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            read_exact_by(stream, &mut addr, deadline).await?;
            Ipv6Addr::from(addr).to_string()
        }
        other => {
            let _ = write_reply(stream, reply::ADDR_NOT_SUPPORTED).await;
            return Err(Socks5Error::UnsupportedAddressType(other));
        }
    };

    let mut port = [0u8; 2];
    read_exact_by(stream, &mut port, deadline).await?;
    Ok(Socks5Request {
        host,
        port: u16::from_be_bytes(port),
    })
}

pub async fn reply_success<S>(stream: &mut S) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_reply(stream, reply::SUCCESS).await
}

pub async fn reply_failure<S>(stream: &mut S, code: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_reply(stream, code).await
}

async fn write_reply<S>(stream: &mut S, code: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    // Bound address is always reported as 0.0.0.0:0.
    let reply = [VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&reply).await
}

async fn read_exact_by<S>(
    stream: &mut S,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<(), Socks5Error>
where
    S: AsyncRead + Unpin,
{
    match timeout_at(deadline, stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) | Err(_) => Err(Socks5Error::Aborted),
    }
}

async fn write_all_by<S>(
    stream: &mut S,
    bytes: &[u8],
    deadline: Instant,
) -> Result<(), Socks5Error>
where
    S: AsyncWrite + Unpin,
{
    match timeout_at(deadline, stream.write_all(bytes)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) | Err(_) => Err(Socks5Error::Aborted),
    }
}
