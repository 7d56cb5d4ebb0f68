//! SOCKS5 wire format (RFC 1928): method negotiation and the CONNECT
//! request/reply. Parsing works directly against the bytes already sitting
//! in a session's buffer -- no heap allocation for the fixed-layout pieces,
//! and multi-byte fields are left in the byte order they arrived in; nothing
//! here converts to/from host order.

mod address;

pub use address::Address;

use crate::constants::*;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// `buf` doesn't hold a full frame yet. Not a protocol violation -- the
    /// caller should read more bytes and retry, rather than assume a single
    /// read always delivers a complete SOCKS5 message.
    #[error("not enough bytes buffered yet")]
    Incomplete,
    #[error("unsupported SOCKS version {0:#x}")]
    BadVersion(u8),
    #[error("unsupported address type {0:#x}")]
    BadAddressType(u8),
    #[error("domain name is not valid UTF-8")]
    BadDomain,
}

/// The client's method-negotiation request: `ver(1) | nauth(1) | auth[nauth]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub methods: Vec<u8>,
}

impl Greeting {
    /// Parses a greeting out of `buf`, returning it and the number of bytes
    /// consumed.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        if buf.len() < 2 {
            return Err(CodecError::Incomplete);
        }
        let ver = buf[0];
        if ver != SOCKS_VERSION {
            return Err(CodecError::BadVersion(ver));
        }
        let nauth = buf[1] as usize;
        let total = 2 + nauth;
        if buf.len() < total {
            return Err(CodecError::Incomplete);
        }
        Ok((
            Greeting {
                methods: buf[2..total].to_vec(),
            },
            total,
        ))
    }

    pub fn supports_no_auth(&self) -> bool {
        self.methods.contains(&AUTH_NO_AUTH)
    }
}

/// Writes the greeting response (`ver(1) | method(1)`) into `out`.
pub fn write_chosen_method(out: &mut Vec<u8>, method: u8) {
    out.push(SOCKS_VERSION);
    out.push(method);
}

/// The client's CONNECT request: `ver | cmd | rsv | atyp | dst_addr | dst_port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub cmd: u8,
    pub addr: Address,
    pub port: u16,
}

impl ConnectRequest {
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        if buf.len() < 4 {
            return Err(CodecError::Incomplete);
        }
        let ver = buf[0];
        if ver != SOCKS_VERSION {
            return Err(CodecError::BadVersion(ver));
        }
        let cmd = buf[1];
        // buf[2] is rsv, ignored.
        let atyp = buf[3];
        let (addr, addr_len) = Address::parse(atyp, &buf[4..])?;
        let total = 4 + addr_len + 2;
        if buf.len() < total {
            return Err(CodecError::Incomplete);
        }
        let port = u16::from_be_bytes([buf[total - 2], buf[total - 1]]);
        Ok((ConnectRequest { cmd, addr, port }, total))
    }
}

/// Writes a CONNECT reply (`ver | rep | rsv | atyp | bnd_addr | bnd_port`),
/// echoing `addr`/`port` verbatim on success. The encoded length tracks
/// `addr`'s own variant -- 10 octets for IPv4, 22 for IPv6, `7 + len(name)`
/// for a domain -- rather than always emitting the IPv4-sized reply.
pub fn write_reply(out: &mut Vec<u8>, rep: u8, addr: &Address, port: u16) {
    out.push(SOCKS_VERSION);
    out.push(rep);
    out.push(0x00);
    addr.write(out);
    out.extend_from_slice(&port.to_be_bytes());
}

/// Writes a general-failure reply. RFC 1928 doesn't mandate a meaningful
/// `bnd_addr`/`bnd_port` on failure; this proxy echoes the request's address
/// unchanged, matching the original implementation's behavior.
pub fn write_failure_reply(out: &mut Vec<u8>, addr: &Address, port: u16) {
    write_reply(out, REP_GENERAL_FAILURE, addr, port);
}
