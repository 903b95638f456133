//! Packet device interface and the TUN-backed implementation.

use crate::error::{SetupError, SetupResult};
use ipnet::Ipv4Net;
use std::future::Future;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tun::{AbstractDevice, Configuration, DeviceReader, DeviceWriter};

/// A device that exchanges whole IP packets.
///
/// Shared through `Arc` between exactly one reader task and one writer task.
/// Each `read_packet` call returns one packet; each `write_packet` call
/// writes one.
pub trait PacketDevice: Send + Sync + 'static {
    fn read_packet(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    fn write_packet(&self, packet: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    fn mtu(&self) -> u16;
}

/// TUN device configuration.
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Interface name. The system picks one when `None`.
    pub name: Option<String>,
    /// Local address and prefix, e.g. `10.50.0.2/24`.
    pub address: Ipv4Net,
    pub mtu: u16,
}

impl TunConfig {
    pub fn new(address: Ipv4Net) -> Self {
        Self {
            name: None,
            address,
            mtu: 1500,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }
}

/// A TUN interface split into independently locked read and write halves.
pub struct TunDevice {
    reader: Mutex<DeviceReader>,
    writer: Mutex<DeviceWriter>,
    name: String,
    mtu: u16,
}

impl TunDevice {
    /// Create the interface, assign its address and bring it up.
    pub fn create(config: TunConfig) -> SetupResult<Self> {
        let mut tun_config = Configuration::default();
        tun_config
            .address(config.address.addr())
            .netmask(config.address.netmask())
            .mtu(config.mtu)
            .up();

        if let Some(ref name) = config.name {
            #[allow(deprecated)]
            tun_config.name(name);
        }

        #[cfg(target_os = "linux")]
        tun_config.platform_config(|platform_config| {
            platform_config.ensure_root_privileges(true);
        });

        let device = tun::create_as_async(&tun_config)
            .map_err(|e| SetupError::tun_device_with_source("Failed to create TUN device", e))?;

        let name = device
            .tun_name()
            .map_err(|e| SetupError::tun_device_with_source("Failed to get TUN name", e))?;

        // tun returns (writer, reader)
        let (writer, reader) = device
            .split()
            .map_err(|e| SetupError::tun_device_with_source("Failed to split TUN device", e))?;

        log::info!(
            "Created TUN device: {} with address {} (mtu {})",
            name,
            config.address,
            config.mtu
        );

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            name,
            mtu: config.mtu,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PacketDevice for TunDevice {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.lock().await.read(buf).await
    }

    async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        self.writer.lock().await.write_all(packet).await
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }
}
