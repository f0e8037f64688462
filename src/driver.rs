//! [`SerialDriver`] trait to support different serial port implementations.

use std::io;
use std::time::Duration;

#[cfg(feature = "serial2")]
pub mod serial2;

/// A serial port backend.
///
/// The access object forwards all port operations to a driver. The driver
/// reports errors as [`std::io::Error`], which are passed through to the
/// calling controller unchanged.
///
/// All functions take `&self`: the access object issues reads and writes
/// concurrently (typically one reader and one writer), while configuration
/// calls are serialized by the access object itself.
///
/// A driver represents a port that may be closed. Operations on a closed
/// port should fail with [`std::io::ErrorKind::NotConnected`]. Operations
/// the backend cannot express should fail with
/// [`std::io::ErrorKind::Unsupported`].
pub trait SerialDriver: Send + Sync + 'static {
	/// Open the port.
	///
	/// Fails if the port is already open.
	fn open(&self) -> io::Result<()>;

	/// Close the port.
	fn close(&self) -> io::Result<()>;

	/// Check if the port is open.
	fn is_open(&self) -> bool;

	/// Get the number of bytes waiting in the input buffer.
	fn available(&self) -> io::Result<usize>;

	/// Read bytes from the port.
	///
	/// Blocks until at least one byte is available or the read timeout
	/// expires. A timeout is reported as [`std::io::ErrorKind::TimedOut`].
	fn read(&self, buffer: &mut [u8]) -> io::Result<usize>;

	/// Write bytes to the port, returning the number of bytes written.
	fn write(&self, data: &[u8]) -> io::Result<usize>;

	/// Write all bytes in `data` to the port.
	fn write_all(&self, data: &[u8]) -> io::Result<()>;

	/// Block until all written data has been transmitted.
	fn flush(&self) -> io::Result<()>;

	/// Discard the input buffer of the port.
	fn discard_input_buffer(&self) -> io::Result<()>;

	/// Discard the output buffer of the port.
	fn discard_output_buffer(&self) -> io::Result<()>;

	fn baud_rate(&self) -> io::Result<u32>;
	fn set_baud_rate(&self, baud_rate: u32) -> io::Result<()>;

	fn char_size(&self) -> io::Result<CharSize>;
	fn set_char_size(&self, char_size: CharSize) -> io::Result<()>;

	fn parity(&self) -> io::Result<Parity>;
	fn set_parity(&self, parity: Parity) -> io::Result<()>;

	fn stop_bits(&self) -> io::Result<StopBits>;
	fn set_stop_bits(&self, stop_bits: StopBits) -> io::Result<()>;

	fn flow_control(&self) -> io::Result<FlowControl>;
	fn set_flow_control(&self, flow_control: FlowControl) -> io::Result<()>;

	fn read_timeout(&self) -> io::Result<Duration>;
	fn set_read_timeout(&self, timeout: Duration) -> io::Result<()>;

	fn write_timeout(&self) -> io::Result<Duration>;
	fn set_write_timeout(&self, timeout: Duration) -> io::Result<()>;

	/// Set the state of the RTS (request to send) line.
	fn set_rts(&self, state: bool) -> io::Result<()>;

	/// Read the state of the CTS (clear to send) line.
	fn read_cts(&self) -> io::Result<bool>;

	/// Set the state of the DTR (data terminal ready) line.
	fn set_dtr(&self, state: bool) -> io::Result<()>;

	/// Read the state of the DSR (data set ready) line.
	fn read_dsr(&self) -> io::Result<bool>;

	/// Read the state of the RI (ring indicator) line.
	fn read_ri(&self) -> io::Result<bool>;

	/// Read the state of the CD (carrier detect) line.
	fn read_cd(&self) -> io::Result<bool>;

	/// List the serial devices the backend can see.
	///
	/// Backends that cannot enumerate devices return an empty list.
	/// The `description` and `hardware_id` fields may be empty strings if
	/// the backend does not report them.
	fn enumerate() -> io::Result<Vec<DeviceInfo>>
	where
		Self: Sized,
	{
		Ok(Vec::new())
	}
}

/// Metadata for an enumerated serial device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
	/// The device name, such as `/dev/ttyUSB0` or `COM3`.
	pub name: String,

	/// A human readable description of the device. May be empty.
	pub description: String,

	/// The hardware ID of the device. May be empty.
	pub hardware_id: String,
}

/// The number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharSize {
	Bits5,
	Bits6,
	Bits7,
	Bits8,
}

/// The parity check mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
	None,
	Odd,
	Even,
}

/// The number of stop bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
	One,
	Two,
}

/// The flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
	None,
	XonXoff,
	RtsCts,
}

/// A full set of port settings, applied in one call.
///
/// Settings are applied in field order. If applying one fails the later
/// ones are not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
	pub baud_rate: u32,
	pub char_size: CharSize,
	pub parity: Parity,
	pub stop_bits: StopBits,
	pub flow_control: FlowControl,
	pub read_timeout: Duration,
	pub write_timeout: Duration,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			baud_rate: 9600,
			char_size: CharSize::Bits8,
			parity: Parity::None,
			stop_bits: StopBits::One,
			flow_control: FlowControl::None,
			read_timeout: Duration::from_millis(500),
			write_timeout: Duration::from_millis(500),
		}
	}
}
