//! Initial handshake (protocol v10) parsing and the client's replies: the
//! SSL request short form and the full handshake response.

use crate::consts::{CapabilityFlags, StatusFlags};
use crate::error::{Error, Result};
use crate::proto::codec::{put_lenenc_bytes, put_null_str, ParseBuf};

#[derive(Debug, Clone)]
pub struct HandshakeInit {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Full auth seed: 8-byte part one plus the extension, usually 20 bytes.
    pub nonce: Vec<u8>,
    pub capabilities: CapabilityFlags,
    pub default_collation: u8,
    pub status: StatusFlags,
    pub auth_plugin: String,
}

pub fn parse_handshake(payload: &[u8]) -> Result<HandshakeInit> {
    let mut b = ParseBuf(payload);
    let protocol_version = b.eat_u8()?;
    if protocol_version != 10 {
        return Err(Error::malformed(&format!(
            "unsupported handshake protocol version {protocol_version}"
        )));
    }
    let server_version = String::from_utf8_lossy(b.eat_null_bytes()?).into_owned();
    let connection_id = b.eat_u32_le()?;
    let mut nonce = b.eat_bytes(8)?.to_vec();
    b.skip(1)?; // filler
    let cap_low = b.eat_u16_le()?;
    let default_collation = b.eat_u8()?;
    let status = StatusFlags::from_bits_truncate(b.eat_u16_le()?);
    let cap_high = b.eat_u16_le()?;
    let auth_data_len = b.eat_u8()?;
    b.skip(10)?; // reserved
    let capabilities =
        CapabilityFlags::from_bits_truncate(u32::from(cap_low) | u32::from(cap_high) << 16);
    if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
        let part2_len = usize::from(auth_data_len).saturating_sub(8).max(13);
        let part2 = b.eat_bytes(part2_len.min(b.len()))?;
        let part2 = match part2.last() {
            Some(0) => &part2[..part2.len() - 1],
            _ => part2,
        };
        nonce.extend_from_slice(part2);
    }
    let auth_plugin = if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
        String::from_utf8_lossy(b.eat_null_bytes()?).into_owned()
    } else {
        String::new()
    };
    Ok(HandshakeInit {
        protocol_version,
        server_version,
        connection_id,
        nonce,
        capabilities,
        default_collation,
        status,
        auth_plugin,
    })
}

/// The 32-byte pre-TLS request: capabilities, max packet and collation only.
pub fn build_ssl_request(caps: CapabilityFlags, max_packet: u32, collation: u8) -> Vec<u8> {
    let mut p = Vec::with_capacity(32);
    p.extend_from_slice(&caps.bits().to_le_bytes());
    p.extend_from_slice(&max_packet.to_le_bytes());
    p.push(collation);
    p.extend_from_slice(&[0u8; 23]);
    p
}

pub fn build_handshake_response(
    caps: CapabilityFlags,
    max_packet: u32,
    collation: u8,
    user: &str,
    auth_data: &[u8],
    database: &str,
    auth_plugin: &str,
) -> Vec<u8> {
    let mut p = build_ssl_request(caps, max_packet, collation);
    put_null_str(&mut p, user);
    if caps.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
        put_lenenc_bytes(&mut p, auth_data);
    } else {
        p.push(auth_data.len() as u8);
        p.extend_from_slice(auth_data);
    }
    if caps.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
        put_null_str(&mut p, database);
    }
    if caps.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
        put_null_str(&mut p, auth_plugin);
    }
    p
}

#[derive(Debug, Clone)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub nonce: Vec<u8>,
}

/// An `0xfe` payload too long for an EOF is the server switching plugins.
pub fn parse_auth_switch(payload: &[u8]) -> Result<AuthSwitchRequest> {
    let mut b = ParseBuf(&payload[1..]);
    let plugin = String::from_utf8_lossy(b.eat_null_bytes()?).into_owned();
    let mut nonce = b.eat_rest().to_vec();
    if nonce.last() == Some(&0) {
        nonce.pop();
    }
    Ok(AuthSwitchRequest { plugin, nonce })
}
