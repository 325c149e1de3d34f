//! Minimal STUN (RFC 5389) binding request/response codec
//!
//! Only what NAT probing needs: encoding a Binding Request and pulling the
//! mapped address out of a Binding Response. Both MAPPED-ADDRESS and
//! XOR-MAPPED-ADDRESS are recognized; only IPv4 (family 0x01) is supported.

use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_RESPONSE: u16 = 0x0101;
pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StunError {
    #[error("response too short ({0} bytes)")]
    TooShort(usize),
    #[error("unexpected message type {0:#06x}")]
    UnexpectedMessageType(u16),
    #[error("transaction ID mismatch")]
    TransactionMismatch,
    #[error("no mapped address in response")]
    NoMappedAddress,
}

/// 96-bit transaction ID carried in every STUN message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionId(pub [u8; 12]);

impl TransactionId {
    pub fn random() -> Self {
        let mut id = [0u8; 12];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut id);
        Self(id)
    }
}

/// Encode a Binding Request: 20-byte header, no attributes.
pub fn encode_binding_request(transaction_id: TransactionId) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    buf[2..4].copy_from_slice(&0u16.to_be_bytes());
    buf[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf[8..20].copy_from_slice(&transaction_id.0);
    buf
}

/// Parse a Binding Response and return the mapped public address.
///
/// The transaction ID must match the request; a mismatch or an unexpected
/// message type is a per-server protocol failure.
pub fn parse_binding_response(
    data: &[u8],
    transaction_id: TransactionId,
) -> Result<SocketAddrV4, StunError> {
    if data.len() < HEADER_LEN {
        return Err(StunError::TooShort(data.len()));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_RESPONSE {
        return Err(StunError::UnexpectedMessageType(msg_type));
    }
    if data[8..20] != transaction_id.0 {
        return Err(StunError::TransactionMismatch);
    }

    parse_attributes(&data[HEADER_LEN..]).ok_or(StunError::NoMappedAddress)
}

fn parse_attributes(mut attrs: &[u8]) -> Option<SocketAddrV4> {
    let mut mapped = None;

    while attrs.len() >= 4 {
        let attr_type = u16::from_be_bytes([attrs[0], attrs[1]]);
        let attr_len = u16::from_be_bytes([attrs[2], attrs[3]]) as usize;
        let Some(value) = attrs.get(4..4 + attr_len) else {
            // Truncated trailing attribute: keep whatever was parsed.
            break;
        };

        if (attr_type == ATTR_MAPPED_ADDRESS || attr_type == ATTR_XOR_MAPPED_ADDRESS)
            && attr_len >= 8
            && value[1] == 0x01
        {
            let mut port = u16::from_be_bytes([value[2], value[3]]);
            let mut octets = [value[4], value[5], value[6], value[7]];

            if attr_type == ATTR_XOR_MAPPED_ADDRESS {
                port ^= (MAGIC_COOKIE >> 16) as u16;
                let cookie = MAGIC_COOKIE.to_be_bytes();
                for (octet, key) in octets.iter_mut().zip(cookie.iter()) {
                    *octet ^= key;
                }
            }

            mapped = Some(SocketAddrV4::new(Ipv4Addr::from(octets), port));
        }

        // Attribute values are padded to a 4-byte boundary.
        let advance = 4 + ((attr_len + 3) & !3);
        match attrs.get(advance..) {
            Some(rest) => attrs = rest,
            None => break,
        }
    }

    mapped
}
