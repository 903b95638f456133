//! wstun library
//!
//! Client-side layer-3 tunnel: IP packets read from a TUN device are relayed
//! as binary WebSocket frames to a remote relay, and frames from the relay
//! are written back to the device.

pub mod backoff;
pub mod config;
pub mod device;
pub mod dialer;
pub mod error;
pub mod handshake;
pub mod lock;
pub mod relay;
pub mod route;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use dialer::{Dialer, DialerConfig, TlsPolicy, WsDialer};
pub use error::{DialError, RelayError, SetupError};
pub use supervisor::{Supervisor, SupervisorState};
