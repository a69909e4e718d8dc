//! Client/server wire plumbing: packet framing, length-encoded primitives,
//! handshake and auth payloads, and the generic response packets.

pub mod auth;
pub mod codec;
pub mod handshake;
pub mod packet;
pub mod packets;
