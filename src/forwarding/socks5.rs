//! SOCKS5 subset: no-auth handshake and `CONNECT` (RFC 1928)

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS5_VERSION: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

#[derive(Error, Debug)]
pub enum Socks5Error {
    #[error("Unsupported SOCKS version: {0}")]
    Version(u8),

    #[error("Client offers no acceptable authentication method")]
    NoAcceptableAuth,

    #[error("Unsupported SOCKS command: {0}")]
    UnsupportedCommand(u8),

    #[error("Unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("Malformed SOCKS message: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reply codes sent in place of the command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl ReplyCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => ReplyCode::Succeeded,
            0x01 => ReplyCode::GeneralFailure,
            0x02 => ReplyCode::NotAllowed,
            0x03 => ReplyCode::NetworkUnreachable,
            0x04 => ReplyCode::HostUnreachable,
            0x05 => ReplyCode::ConnectionRefused,
            0x06 => ReplyCode::TtlExpired,
            0x07 => ReplyCode::CommandNotSupported,
            0x08 => ReplyCode::AddressTypeNotSupported,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

impl TargetAddr {
    pub fn address_type(&self) -> u8 {
        match self {
            TargetAddr::Ipv4(_) => ATYP_IPV4,
            TargetAddr::Domain(_) => ATYP_DOMAIN,
            TargetAddr::Ipv6(_) => ATYP_IPV6,
        }
    }

    /// Host string for a direct-tcpip open.
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ipv4(ip) => ip.to_string(),
            TargetAddr::Domain(name) => name.clone(),
            TargetAddr::Ipv6(ip) => ip.to_string(),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), Socks5Error> {
        out.push(self.address_type());
        match self {
            TargetAddr::Ipv4(ip) => out.extend_from_slice(&ip.octets()),
            TargetAddr::Domain(name) => {
                let len = u8::try_from(name.len())
                    .map_err(|_| Socks5Error::Malformed(format!("domain of {} bytes", name.len())))?;
                out.push(len);
                out.extend_from_slice(name.as_bytes());
            }
            TargetAddr::Ipv6(ip) => out.extend_from_slice(&ip.octets()),
        }
        Ok(())
    }

    /// Decode the address following its type byte; returns the bytes used.
    fn parse(atyp: u8, data: &[u8]) -> Result<(Self, usize), Socks5Error> {
        let short = || Socks5Error::Malformed("truncated address".into());
        match atyp {
            ATYP_IPV4 => {
                let octets: [u8; 4] = data.get(..4).ok_or_else(short)?.try_into().map_err(|_| short())?;
                Ok((TargetAddr::Ipv4(Ipv4Addr::from(octets)), 4))
            }
            ATYP_DOMAIN => {
                let len = *data.first().ok_or_else(short)? as usize;
                let name = data.get(1..1 + len).ok_or_else(short)?;
                let name = String::from_utf8(name.to_vec())
                    .map_err(|_| Socks5Error::Malformed("domain is not UTF-8".into()))?;
                Ok((TargetAddr::Domain(name), 1 + len))
            }
            ATYP_IPV6 => {
                let octets: [u8; 16] = data.get(..16).ok_or_else(short)?.try_into().map_err(|_| short())?;
                Ok((TargetAddr::Ipv6(Ipv6Addr::from(octets)), 16))
            }
            other => Err(Socks5Error::UnsupportedAddressType(other)),
        }
    }
}

/// Client request: `VER CMD RSV ATYP ADDR PORT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Request {
    pub command: u8,
    pub address: TargetAddr,
    pub port: u16,
}

impl Socks5Request {
    pub fn connect(address: TargetAddr, port: u16) -> Self {
        Self {
            command: CMD_CONNECT,
            address,
            port,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Socks5Error> {
        encode_message(self.command, &self.address, self.port)
    }

    pub fn parse(data: &[u8]) -> Result<(Self, usize), Socks5Error> {
        let (command, address, port, used) = parse_message(data)?;
        Ok((Self { command, address, port }, used))
    }
}

/// Server reply: `VER REP RSV ATYP BND.ADDR BND.PORT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Reply {
    pub code: ReplyCode,
    pub address: TargetAddr,
    pub port: u16,
}

impl Socks5Reply {
    /// Reply bound to `0.0.0.0:0`.
    pub fn new(code: ReplyCode) -> Self {
        Self {
            code,
            address: TargetAddr::Ipv4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Socks5Error> {
        encode_message(self.code as u8, &self.address, self.port)
    }

    pub fn parse(data: &[u8]) -> Result<(Self, usize), Socks5Error> {
        let (code, address, port, used) = parse_message(data)?;
        let code = ReplyCode::from_u8(code)
            .ok_or_else(|| Socks5Error::Malformed(format!("reply code {:#04x}", code)))?;
        Ok((Self { code, address, port }, used))
    }
}

fn encode_message(code: u8, address: &TargetAddr, port: u16) -> Result<Vec<u8>, Socks5Error> {
    let mut out = vec![SOCKS5_VERSION, code, 0x00];
    address.encode(&mut out)?;
    out.extend_from_slice(&port.to_be_bytes());
    Ok(out)
}

fn parse_message(data: &[u8]) -> Result<(u8, TargetAddr, u16, usize), Socks5Error> {
    let header = data
        .get(..4)
        .ok_or_else(|| Socks5Error::Malformed("truncated header".into()))?;
    if header[0] != SOCKS5_VERSION {
        return Err(Socks5Error::Version(header[0]));
    }
    let (address, used) = TargetAddr::parse(header[3], &data[4..])?;
    let at = 4 + used;
    let port = data
        .get(at..at + 2)
        .ok_or_else(|| Socks5Error::Malformed("truncated port".into()))?;
    Ok((header[1], address, u16::from_be_bytes([port[0], port[1]]), at + 2))
}

/// Server side of the method negotiation. Only "no authentication" is
/// accepted; otherwise `0xFF` is sent and the connection should be closed.
pub async fn accept_handshake<S>(stream: &mut S) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(Socks5Error::Version(header[0]));
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&AUTH_NONE) {
        stream.write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE]).await?;
        return Err(Socks5Error::NoAcceptableAuth);
    }
    stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;
    Ok(())
}

/// Read a `CONNECT` request. Unsupported commands and address types are
/// answered with their reply code before the error is returned.
pub async fn read_request<S>(stream: &mut S) -> Result<Socks5Request, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(Socks5Error::Version(header[0]));
    }
    if header[1] != CMD_CONNECT {
        write_reply(stream, ReplyCode::CommandNotSupported).await?;
        return Err(Socks5Error::UnsupportedCommand(header[1]));
    }

    let address = match header[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            TargetAddr::Ipv4(Ipv4Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let name = String::from_utf8(name).map_err(|_| Socks5Error::Malformed("domain is not UTF-8".into()))?;
            TargetAddr::Domain(name)
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            TargetAddr::Ipv6(Ipv6Addr::from(octets))
        }
        other => {
            write_reply(stream, ReplyCode::AddressTypeNotSupported).await?;
            return Err(Socks5Error::UnsupportedAddressType(other));
        }
    };
    let port = stream.read_u16().await?;
    Ok(Socks5Request::connect(address, port))
}

pub async fn write_reply<S>(stream: &mut S, code: ReplyCode) -> Result<(), Socks5Error>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&Socks5Reply::new(code).encode()?).await?;
    stream.flush().await?;
    Ok(())
}
