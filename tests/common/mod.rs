pub mod controllers;
pub mod mock_driver;

use std::sync::{Arc, Mutex};

use portshare::{Port, PortRegistry};

pub use controllers::{as_strs, Events, TestController};
pub use mock_driver::MockDriver;

/// Everything a test needs: a registry over one shared mock driver, a port
/// handle on it, and an event log for test controllers.
pub struct Rig {
	pub mock: MockDriver,
	pub registry: PortRegistry<MockDriver>,
	pub port: Port<MockDriver>,
	pub events: Events,
}

impl Rig {
	pub fn new() -> Self {
		let mock = MockDriver::new();
		let registry = PortRegistry::with_driver({
			let mock = mock.clone();
			move |_name| mock.clone()
		});
		let port = registry.port("mock0").unwrap();
		Self {
			mock,
			registry,
			port,
			events: Arc::new(Mutex::new(Vec::new())),
		}
	}

	pub fn controller(&self, name: &'static str) -> TestController {
		TestController::new(&self.port, name, &self.events)
	}

	/// Drain the event log.
	pub fn take_events(&self) -> Vec<String> {
		std::mem::take(&mut *self.events.lock().unwrap())
	}
}
