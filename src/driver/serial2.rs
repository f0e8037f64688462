//! Driver implementation using the `serial2` crate.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{CharSize, DeviceInfo, FlowControl, Parity, SerialDriver, StopBits};

/// A [`SerialDriver`] backed by [`serial2::SerialPort`].
///
/// The driver remembers the device path and starts out closed. Opening keeps
/// whatever settings the port already has, so controllers normally apply
/// their preferred configuration after opening.
pub struct SerialPortDriver {
	path: PathBuf,

	// The open port, if any. I/O calls clone the inner `Arc` and release the
	// lock before touching the port, so a `close()` never waits on an
	// in-flight read. The file descriptor is released once the last
	// outstanding call returns.
	port: Mutex<Option<Arc<serial2::SerialPort>>>,
}

impl SerialPortDriver {
	/// Create a driver for the given device path. The port is not opened.
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			port: Mutex::new(None),
		}
	}

	fn port(&self) -> io::Result<Arc<serial2::SerialPort>> {
		self.port
			.lock()
			.unwrap()
			.as_ref()
			.cloned()
			.ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port is not open"))
	}

	fn update_settings<F>(&self, update: F) -> io::Result<()>
	where
		F: FnOnce(&mut serial2::Settings) -> io::Result<()>,
	{
		let port = self.port()?;
		let mut settings = port.get_configuration()?;
		update(&mut settings)?;
		port.set_configuration(&settings)
	}
}

impl SerialDriver for SerialPortDriver {
	fn open(&self) -> io::Result<()> {
		let mut port = self.port.lock().unwrap();
		if port.is_some() {
			return Err(io::Error::new(io::ErrorKind::AlreadyExists, "port is already open"));
		}
		*port = Some(Arc::new(serial2::SerialPort::open(&self.path, serial2::KeepSettings)?));
		Ok(())
	}

	fn close(&self) -> io::Result<()> {
		self.port.lock().unwrap().take();
		Ok(())
	}

	fn is_open(&self) -> bool {
		self.port.lock().unwrap().is_some()
	}

	fn available(&self) -> io::Result<usize> {
		// Not exposed by serial2.
		Err(io::ErrorKind::Unsupported.into())
	}

	fn read(&self, buffer: &mut [u8]) -> io::Result<usize> {
		self.port()?.read(buffer)
	}

	fn write(&self, data: &[u8]) -> io::Result<usize> {
		self.port()?.write(data)
	}

	fn write_all(&self, data: &[u8]) -> io::Result<()> {
		self.port()?.write_all(data)
	}

	fn flush(&self) -> io::Result<()> {
		use io::Write;
		let port = self.port()?;
		(&mut &*port).flush()
	}

	fn discard_input_buffer(&self) -> io::Result<()> {
		self.port()?.discard_input_buffer()
	}

	fn discard_output_buffer(&self) -> io::Result<()> {
		self.port()?.discard_output_buffer()
	}

	fn baud_rate(&self) -> io::Result<u32> {
		self.port()?.get_configuration()?.get_baud_rate()
	}

	fn set_baud_rate(&self, baud_rate: u32) -> io::Result<()> {
		self.update_settings(|settings| settings.set_baud_rate(baud_rate))
	}

	fn char_size(&self) -> io::Result<CharSize> {
		Ok(char_size_from_serial2(self.port()?.get_configuration()?.get_char_size()?))
	}

	fn set_char_size(&self, char_size: CharSize) -> io::Result<()> {
		self.update_settings(|settings| {
			settings.set_char_size(char_size_to_serial2(char_size));
			Ok(())
		})
	}

	fn parity(&self) -> io::Result<Parity> {
		Ok(parity_from_serial2(self.port()?.get_configuration()?.get_parity()?))
	}

	fn set_parity(&self, parity: Parity) -> io::Result<()> {
		self.update_settings(|settings| {
			settings.set_parity(parity_to_serial2(parity));
			Ok(())
		})
	}

	fn stop_bits(&self) -> io::Result<StopBits> {
		Ok(stop_bits_from_serial2(self.port()?.get_configuration()?.get_stop_bits()?))
	}

	fn set_stop_bits(&self, stop_bits: StopBits) -> io::Result<()> {
		self.update_settings(|settings| {
			settings.set_stop_bits(stop_bits_to_serial2(stop_bits));
			Ok(())
		})
	}

	fn flow_control(&self) -> io::Result<FlowControl> {
		Ok(flow_control_from_serial2(self.port()?.get_configuration()?.get_flow_control()?))
	}

	fn set_flow_control(&self, flow_control: FlowControl) -> io::Result<()> {
		self.update_settings(|settings| {
			settings.set_flow_control(flow_control_to_serial2(flow_control));
			Ok(())
		})
	}

	fn read_timeout(&self) -> io::Result<Duration> {
		self.port()?.get_read_timeout()
	}

	fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
		self.port()?.set_read_timeout(timeout)
	}

	fn write_timeout(&self) -> io::Result<Duration> {
		self.port()?.get_write_timeout()
	}

	fn set_write_timeout(&self, timeout: Duration) -> io::Result<()> {
		self.port()?.set_write_timeout(timeout)
	}

	fn set_rts(&self, state: bool) -> io::Result<()> {
		self.port()?.set_rts(state)
	}

	fn read_cts(&self) -> io::Result<bool> {
		self.port()?.read_cts()
	}

	fn set_dtr(&self, state: bool) -> io::Result<()> {
		self.port()?.set_dtr(state)
	}

	fn read_dsr(&self) -> io::Result<bool> {
		self.port()?.read_dsr()
	}

	fn read_ri(&self) -> io::Result<bool> {
		self.port()?.read_ri()
	}

	fn read_cd(&self) -> io::Result<bool> {
		self.port()?.read_cd()
	}

	fn enumerate() -> io::Result<Vec<DeviceInfo>> {
		// serial2 reports device paths only.
		let ports = serial2::SerialPort::available_ports()?;
		Ok(ports
			.into_iter()
			.map(|path| DeviceInfo {
				name: path.display().to_string(),
				description: String::new(),
				hardware_id: String::new(),
			})
			.collect())
	}
}

impl std::fmt::Debug for SerialPortDriver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SerialPortDriver")
			.field("path", &self.path)
			.field("open", &self.is_open())
			.finish()
	}
}

fn char_size_to_serial2(char_size: CharSize) -> serial2::CharSize {
	match char_size {
		CharSize::Bits5 => serial2::CharSize::Bits5,
		CharSize::Bits6 => serial2::CharSize::Bits6,
		CharSize::Bits7 => serial2::CharSize::Bits7,
		CharSize::Bits8 => serial2::CharSize::Bits8,
	}
}

fn char_size_from_serial2(char_size: serial2::CharSize) -> CharSize {
	match char_size {
		serial2::CharSize::Bits5 => CharSize::Bits5,
		serial2::CharSize::Bits6 => CharSize::Bits6,
		serial2::CharSize::Bits7 => CharSize::Bits7,
		serial2::CharSize::Bits8 => CharSize::Bits8,
	}
}

fn parity_to_serial2(parity: Parity) -> serial2::Parity {
	match parity {
		Parity::None => serial2::Parity::None,
		Parity::Odd => serial2::Parity::Odd,
		Parity::Even => serial2::Parity::Even,
	}
}

fn parity_from_serial2(parity: serial2::Parity) -> Parity {
	match parity {
		serial2::Parity::None => Parity::None,
		serial2::Parity::Odd => Parity::Odd,
		serial2::Parity::Even => Parity::Even,
	}
}

fn stop_bits_to_serial2(stop_bits: StopBits) -> serial2::StopBits {
	match stop_bits {
		StopBits::One => serial2::StopBits::One,
		StopBits::Two => serial2::StopBits::Two,
	}
}

fn stop_bits_from_serial2(stop_bits: serial2::StopBits) -> StopBits {
	match stop_bits {
		serial2::StopBits::One => StopBits::One,
		serial2::StopBits::Two => StopBits::Two,
	}
}

fn flow_control_to_serial2(flow_control: FlowControl) -> serial2::FlowControl {
	match flow_control {
		FlowControl::None => serial2::FlowControl::None,
		FlowControl::XonXoff => serial2::FlowControl::XonXoff,
		FlowControl::RtsCts => serial2::FlowControl::RtsCts,
	}
}

fn flow_control_from_serial2(flow_control: serial2::FlowControl) -> FlowControl {
	match flow_control {
		serial2::FlowControl::None => FlowControl::None,
		serial2::FlowControl::XonXoff => FlowControl::XonXoff,
		serial2::FlowControl::RtsCts => FlowControl::RtsCts,
	}
}
