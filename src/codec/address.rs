use super::CodecError;
use crate::constants::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
use std::net::{Ipv4Addr, Ipv6Addr};

/// A SOCKS5 address, as carried in a CONNECT request or reply. `atyp`
/// selects which variant is on the wire; the port is parsed separately by
/// the caller since it sits after the address in both frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

impl Address {
    pub fn atyp(&self) -> u8 {
        match self {
            Address::V4(_) => ATYP_IPV4,
            Address::V6(_) => ATYP_IPV6,
            Address::Domain(_) => ATYP_DOMAIN,
        }
    }

    /// Parses the address body (everything after the `atyp` octet) for the
    /// given `atyp`. Returns the address and how many bytes it consumed.
    pub fn parse(atyp: u8, buf: &[u8]) -> Result<(Self, usize), CodecError> {
        match atyp {
            ATYP_IPV4 => {
                if buf.len() < 4 {
                    return Err(CodecError::Incomplete);
                }
                let octets: [u8; 4] = buf[..4].try_into().unwrap();
                Ok((Address::V4(Ipv4Addr::from(octets)), 4))
            }
            ATYP_IPV6 => {
                if buf.len() < 16 {
                    return Err(CodecError::Incomplete);
                }
                let octets: [u8; 16] = buf[..16].try_into().unwrap();
                Ok((Address::V6(Ipv6Addr::from(octets)), 16))
            }
            ATYP_DOMAIN => {
                if buf.is_empty() {
                    return Err(CodecError::Incomplete);
                }
                let len = buf[0] as usize;
                if buf.len() < 1 + len {
                    return Err(CodecError::Incomplete);
                }
                let name = std::str::from_utf8(&buf[1..1 + len])
                    .map_err(|_| CodecError::BadDomain)?
                    .to_string();
                Ok((Address::Domain(name), 1 + len))
            }
            other => Err(CodecError::BadAddressType(other)),
        }
    }

    /// Serializes `atyp | addr` (not the port) into `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        out.push(self.atyp());
        match self {
            Address::V4(addr) => out.extend_from_slice(&addr.octets()),
            Address::V6(addr) => out.extend_from_slice(&addr.octets()),
            Address::Domain(name) => {
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
            }
        }
    }
}
