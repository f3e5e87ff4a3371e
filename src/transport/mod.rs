//! 传输层：与单个外设的半双工行会话（串口 / 内存替身）

pub mod channel;
pub mod mock;
pub mod notify;
pub mod serial;
pub mod traits;
pub mod wire;

pub use channel::{ChannelSettings, LineChannel, OpenedPort, PortOpener, PortReader, PortWriter};
pub use mock::{MemoryPortOpener, RecordingTransport, SimulatedDevice};
pub use notify::{DeviceNotification, NotificationMapping, NotificationTable};
pub use serial::{serial_channel, SerialChannel, SerialPortOpener};
pub use traits::{ChannelState, DeviceReply, DeviceTransport, TransportError, TransportEvent};
