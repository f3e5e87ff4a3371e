//! 串口打开方式（tokio-serial）
//!
//! 显式配置了端口路径时直接打开；否则枚举 USB 串口，选第一个厂商/产品字符串包含 vendor 的端口。

use async_trait::async_trait;
use tokio_serial::{SerialPortBuilderExt, SerialPortType};

use crate::config::DeviceSection;
use crate::transport::{
    ChannelSettings, LineChannel, NotificationTable, OpenedPort, PortOpener, TransportError,
};

/// 串口通道
pub type SerialChannel = LineChannel<SerialPortOpener>;

/// 按设备配置创建串口通道（尚未连接）
pub fn serial_channel(device: &DeviceSection, notifications: NotificationTable) -> SerialChannel {
    LineChannel::new(
        SerialPortOpener::from_device(device),
        ChannelSettings::from_device(device),
        notifications,
    )
}

#[derive(Debug, Clone)]
pub struct SerialPortOpener {
    port: Option<String>,
    vendor: String,
    baud_rate: u32,
}

impl SerialPortOpener {
    pub fn from_device(device: &DeviceSection) -> Self {
        Self {
            port: device.port.clone(),
            vendor: device.vendor.clone(),
            baud_rate: device.baud_rate,
        }
    }

    fn resolve_port(&self) -> Result<String, TransportError> {
        if let Some(port) = &self.port {
            return Ok(port.clone());
        }

        let ports = tokio_serial::available_ports()
            .map_err(|e| TransportError::Unavailable(format!("port enumeration failed: {e}")))?;

        ports
            .into_iter()
            .find(|p| match &p.port_type {
                SerialPortType::UsbPort(info) => vendor_matches(
                    info.manufacturer.as_deref(),
                    info.product.as_deref(),
                    &self.vendor,
                ),
                _ => false,
            })
            .map(|p| p.port_name)
            .ok_or_else(|| {
                TransportError::Unavailable(format!("no serial device matching '{}'", self.vendor))
            })
    }
}

/// 厂商或产品字符串包含 vendor（不区分大小写）
fn vendor_matches(manufacturer: Option<&str>, product: Option<&str>, vendor: &str) -> bool {
    let needle = vendor.to_lowercase();
    [manufacturer, product]
        .into_iter()
        .flatten()
        .any(|s| s.to_lowercase().contains(&needle))
}

#[async_trait]
impl PortOpener for SerialPortOpener {
    async fn open(&self) -> Result<OpenedPort, TransportError> {
        let path = self.resolve_port()?;
        let stream = tokio_serial::new(&path, self.baud_rate)
            .open_native_async()
            .map_err(|e| TransportError::Unavailable(format!("failed to open {path}: {e}")))?;

        let (reader, writer) = tokio::io::split(stream);
        Ok(OpenedPort {
            name: path,
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}
