//! Session-open message sent as the first client frame.
//!
//! The layout is positional and fixed at 42 bytes:
//!
//! ```text
//! offset  size  field
//!      0    16  client identifier (UUID bytes)
//!     16     1  protocol version
//!     17    16  encryption selector (all zero = no encryption)
//!     33     1  reserved
//!     34     1  command (3 = raw-IP tunnel)
//!     35     2  target port, big-endian
//!     37     1  address type (1 = IPv4)
//!     38     4  target address
//! ```
//!
//! Any change to this layout breaks compatibility with deployed relays and
//! must come with a new [`PROTOCOL_VERSION`].

use bytes::{BufMut, BytesMut};
use serde::Deserialize;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Total size of the canonical handshake.
pub const HANDSHAKE_LEN: usize = 42;

/// Size of the identifier-only compatibility handshake.
pub const ID_ONLY_HANDSHAKE_LEN: usize = 16;

/// Protocol version carried at offset 16.
pub const PROTOCOL_VERSION: u8 = 0;

/// Command selecting raw-IP tunnel mode.
pub const COMMAND_TUNNEL: u8 = 0x03;

/// Address type for a 4-byte IPv4 target.
pub const ADDRESS_TYPE_IPV4: u8 = 0x01;

/// Encryption selector meaning "no encryption".
pub const ENCRYPTION_NONE: [u8; 16] = [0u8; 16];

/// Which session-open message the client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandshakeMode {
    /// Full 42-byte message.
    #[default]
    Canonical,
    /// Only the 16-byte client identifier. Compatibility mode for relays that
    /// start forwarding immediately after the identifier.
    IdOnly,
}

/// Decoded fields of the canonical handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub client_id: Uuid,
    pub version: u8,
    pub encryption: [u8; 16],
    pub reserved: u8,
    pub command: u8,
    pub target_port: u16,
    pub address_type: u8,
    pub target_address: Ipv4Addr,
}

impl HandshakeMessage {
    /// Tunnel-mode message with no explicit target (port 0, 0.0.0.0).
    pub fn tunnel(client_id: Uuid) -> Self {
        Self {
            client_id,
            version: PROTOCOL_VERSION,
            encryption: ENCRYPTION_NONE,
            reserved: 0,
            command: COMMAND_TUNNEL,
            target_port: 0,
            address_type: ADDRESS_TYPE_IPV4,
            target_address: Ipv4Addr::UNSPECIFIED,
        }
    }

    /// Set an explicit target.
    pub fn with_target(mut self, port: u16, address: Ipv4Addr) -> Self {
        self.target_port = port;
        self.target_address = address;
        self
    }

    /// Encode to the fixed 42-byte layout.
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_slice(self.client_id.as_bytes());
        buf.put_u8(self.version);
        buf.put_slice(&self.encryption);
        buf.put_u8(self.reserved);
        buf.put_u8(self.command);
        buf.put_u16(self.target_port);
        buf.put_u8(self.address_type);
        buf.put_slice(&self.target_address.octets());

        let mut out = [0u8; HANDSHAKE_LEN];
        out.copy_from_slice(&buf);
        out
    }

    /// Decode the fixed layout. Returns `None` unless `data` is exactly
    /// [`HANDSHAKE_LEN`] bytes.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != HANDSHAKE_LEN {
            return None;
        }
        let client_id = Uuid::from_slice(&data[0..16]).ok()?;
        let mut encryption = [0u8; 16];
        encryption.copy_from_slice(&data[17..33]);
        Some(Self {
            client_id,
            version: data[16],
            encryption,
            reserved: data[33],
            command: data[34],
            target_port: u16::from_be_bytes([data[35], data[36]]),
            address_type: data[37],
            target_address: Ipv4Addr::new(data[38], data[39], data[40], data[41]),
        })
    }
}

/// Build the canonical handshake. Inputs are expected to be valid; this never
/// fails and performs no I/O.
pub fn build(
    client_id: Uuid,
    target_port: u16,
    address_type: u8,
    target_address: Ipv4Addr,
) -> [u8; HANDSHAKE_LEN] {
    HandshakeMessage {
        address_type,
        ..HandshakeMessage::tunnel(client_id).with_target(target_port, target_address)
    }
    .encode()
}

/// Bytes of the first client frame for the given mode.
pub fn session_open_frame(mode: HandshakeMode, client_id: Uuid) -> Vec<u8> {
    match mode {
        HandshakeMode::Canonical => HandshakeMessage::tunnel(client_id).encode().to_vec(),
        HandshakeMode::IdOnly => client_id.as_bytes().to_vec(),
    }
}
