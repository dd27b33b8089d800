//! Serial port transport.

use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Open `port` as 8N1 without flow control.
///
/// Must be called from within a Tokio runtime.
pub fn open_serial(port: &str, baud_rate: u32) -> Result<SerialStream, tokio_serial::Error> {
    tokio_serial::new(port, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
}
