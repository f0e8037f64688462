use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use portshare::{CharSize, DeviceInfo, FlowControl, Parity, SerialDriver, Settings, StopBits};

/// An in-memory serial driver.
///
/// Clones share the same port state, so a test can keep a handle to feed
/// the receive queue and inspect transmitted data while the registry hands
/// the "same" driver to the access object.
///
/// Reads block until data arrives or the configured read timeout expires,
/// like a real port, which lets tests hold a call in flight on purpose.
#[derive(Clone)]
pub struct MockDriver {
	shared: Arc<Shared>,
}

struct Shared {
	state: Mutex<State>,
	rx_ready: Condvar,
}

struct State {
	open: bool,
	rx: VecDeque<u8>,
	tx: Vec<u8>,
	settings: Settings,
	rts: bool,
	dtr: bool,
	blocked_readers: usize,
}

impl MockDriver {
	pub fn new() -> Self {
		Self {
			shared: Arc::new(Shared {
				state: Mutex::new(State {
					open: false,
					rx: VecDeque::new(),
					tx: Vec::new(),
					settings: Settings::default(),
					rts: false,
					dtr: false,
					blocked_readers: 0,
				}),
				rx_ready: Condvar::new(),
			}),
		}
	}

	/// Queue data for readers and wake them up.
	pub fn push_rx(&self, data: &[u8]) {
		let mut state = self.shared.state.lock().unwrap();
		state.rx.extend(data);
		drop(state);
		self.shared.rx_ready.notify_all();
	}

	/// Take everything written to the port so far.
	pub fn take_tx(&self) -> Vec<u8> {
		std::mem::take(&mut self.shared.state.lock().unwrap().tx)
	}

	/// Wait until `count` readers are blocked waiting for data.
	///
	/// Panics after two seconds, a test that needs more is stuck anyway.
	pub fn wait_for_blocked_readers(&self, count: usize) {
		let deadline = Instant::now() + Duration::from_secs(2);
		loop {
			if self.shared.state.lock().unwrap().blocked_readers >= count {
				return;
			}
			if Instant::now() >= deadline {
				panic!("no reader became blocked in time");
			}
			std::thread::sleep(Duration::from_millis(2));
		}
	}
}

fn not_open() -> io::Error {
	io::Error::new(io::ErrorKind::NotConnected, "port is not open")
}

impl SerialDriver for MockDriver {
	fn open(&self) -> io::Result<()> {
		let mut state = self.shared.state.lock().unwrap();
		if state.open {
			return Err(io::Error::new(io::ErrorKind::AlreadyExists, "port is already open"));
		}
		state.open = true;
		Ok(())
	}

	fn close(&self) -> io::Result<()> {
		let mut state = self.shared.state.lock().unwrap();
		state.open = false;
		drop(state);
		// Pending reads notice the close and return.
		self.shared.rx_ready.notify_all();
		Ok(())
	}

	fn is_open(&self) -> bool {
		self.shared.state.lock().unwrap().open
	}

	fn available(&self) -> io::Result<usize> {
		let state = self.shared.state.lock().unwrap();
		if !state.open {
			return Err(not_open());
		}
		Ok(state.rx.len())
	}

	fn read(&self, buffer: &mut [u8]) -> io::Result<usize> {
		let mut state = self.shared.state.lock().unwrap();
		if !state.open {
			return Err(not_open());
		}
		let deadline = Instant::now() + state.settings.read_timeout;
		state.blocked_readers += 1;
		let result = loop {
			if !state.open {
				break Err(not_open());
			}
			if !state.rx.is_empty() {
				let count = buffer.len().min(state.rx.len());
				for slot in buffer[..count].iter_mut() {
					*slot = state.rx.pop_front().unwrap();
				}
				break Ok(count);
			}
			let now = Instant::now();
			if now >= deadline {
				break Err(io::ErrorKind::TimedOut.into());
			}
			let (next, _) = self.shared.rx_ready.wait_timeout(state, deadline - now).unwrap();
			state = next;
		};
		state.blocked_readers -= 1;
		result
	}

	fn write(&self, data: &[u8]) -> io::Result<usize> {
		let mut state = self.shared.state.lock().unwrap();
		if !state.open {
			return Err(not_open());
		}
		state.tx.extend_from_slice(data);
		Ok(data.len())
	}

	fn write_all(&self, data: &[u8]) -> io::Result<()> {
		self.write(data).map(|_| ())
	}

	fn flush(&self) -> io::Result<()> {
		Ok(())
	}

	fn discard_input_buffer(&self) -> io::Result<()> {
		self.shared.state.lock().unwrap().rx.clear();
		Ok(())
	}

	fn discard_output_buffer(&self) -> io::Result<()> {
		self.shared.state.lock().unwrap().tx.clear();
		Ok(())
	}

	fn baud_rate(&self) -> io::Result<u32> {
		Ok(self.shared.state.lock().unwrap().settings.baud_rate)
	}

	fn set_baud_rate(&self, baud_rate: u32) -> io::Result<()> {
		self.shared.state.lock().unwrap().settings.baud_rate = baud_rate;
		Ok(())
	}

	fn char_size(&self) -> io::Result<CharSize> {
		Ok(self.shared.state.lock().unwrap().settings.char_size)
	}

	fn set_char_size(&self, char_size: CharSize) -> io::Result<()> {
		self.shared.state.lock().unwrap().settings.char_size = char_size;
		Ok(())
	}

	fn parity(&self) -> io::Result<Parity> {
		Ok(self.shared.state.lock().unwrap().settings.parity)
	}

	fn set_parity(&self, parity: Parity) -> io::Result<()> {
		self.shared.state.lock().unwrap().settings.parity = parity;
		Ok(())
	}

	fn stop_bits(&self) -> io::Result<StopBits> {
		Ok(self.shared.state.lock().unwrap().settings.stop_bits)
	}

	fn set_stop_bits(&self, stop_bits: StopBits) -> io::Result<()> {
		self.shared.state.lock().unwrap().settings.stop_bits = stop_bits;
		Ok(())
	}

	fn flow_control(&self) -> io::Result<FlowControl> {
		Ok(self.shared.state.lock().unwrap().settings.flow_control)
	}

	fn set_flow_control(&self, flow_control: FlowControl) -> io::Result<()> {
		self.shared.state.lock().unwrap().settings.flow_control = flow_control;
		Ok(())
	}

	fn read_timeout(&self) -> io::Result<Duration> {
		Ok(self.shared.state.lock().unwrap().settings.read_timeout)
	}

	fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
		self.shared.state.lock().unwrap().settings.read_timeout = timeout;
		Ok(())
	}

	fn write_timeout(&self) -> io::Result<Duration> {
		Ok(self.shared.state.lock().unwrap().settings.write_timeout)
	}

	fn set_write_timeout(&self, timeout: Duration) -> io::Result<()> {
		self.shared.state.lock().unwrap().settings.write_timeout = timeout;
		Ok(())
	}

	fn set_rts(&self, state: bool) -> io::Result<()> {
		self.shared.state.lock().unwrap().rts = state;
		Ok(())
	}

	fn read_cts(&self) -> io::Result<bool> {
		// Loop the control lines back.
		Ok(self.shared.state.lock().unwrap().rts)
	}

	fn set_dtr(&self, state: bool) -> io::Result<()> {
		self.shared.state.lock().unwrap().dtr = state;
		Ok(())
	}

	fn read_dsr(&self) -> io::Result<bool> {
		Ok(self.shared.state.lock().unwrap().dtr)
	}

	fn read_ri(&self) -> io::Result<bool> {
		Ok(false)
	}

	fn read_cd(&self) -> io::Result<bool> {
		Ok(false)
	}

	fn enumerate() -> io::Result<Vec<DeviceInfo>> {
		Ok(vec![DeviceInfo {
			name: String::from("mock0"),
			description: String::from("mock serial device"),
			hardware_id: String::from("MOCK:0001"),
		}])
	}
}
