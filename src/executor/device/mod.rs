//! Real-device executor: state machine firmware behind a byte stream.
//!
//! The stack is organized in layers:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       SerialDevice (HardwareExecutor)    │  handshake, load, run, abort
//! ├─────────────────────────────────────────┤
//! │      HostMessage / DeviceMessage         │  bincode
//! ├─────────────────────────────────────────┤
//! │               Framing                    │  start byte, length, checksum
//! ├─────────────────────────────────────────┤
//! │   AsyncRead + AsyncWrite (serial port)   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The driver is generic over its transport, so the same code runs against a
//! serial port (with the `serial` feature) or an in-memory duplex stream.

mod codec;
mod driver;
mod protocol;
#[cfg(feature = "serial")]
mod serial;

pub use codec::{checksum, FrameCodec, ProtocolError, FRAME_START, MAX_PAYLOAD};
pub use driver::{HostCodec, SerialDevice};
pub use protocol::{
    encode_matrix, target_from_wire, target_to_wire, DeviceMessage, HostMessage, WireState,
    END_TARGET,
};
#[cfg(feature = "serial")]
pub use serial::open_serial;

/// Device-side codec: decodes host messages, encodes device messages.
pub type DeviceCodec = FrameCodec<HostMessage, DeviceMessage>;
