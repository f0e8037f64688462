//! The device registry.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use crate::device::{Device, Port};
use crate::driver::{DeviceInfo, SerialDriver};
use crate::error::UsageError;

/// Hands out port handles and guarantees one device per name.
///
/// A registry owns the driver factory for its ports. The process wide
/// registry over the default backend is available through
/// [`PortRegistry::global`]; separate registries are mainly useful for
/// injecting a different driver, for example in tests.
pub struct PortRegistry<D: SerialDriver> {
	devices: Mutex<HashMap<String, Arc<Device<D>>>>,
	make_driver: Arc<dyn Fn(&str) -> D + Send + Sync>,
}

impl<D: SerialDriver> PortRegistry<D> {
	/// Create a registry that makes drivers with the given factory.
	///
	/// The factory is called once per device, when the first controller
	/// for that device attaches (and again if a device is re-attached
	/// after all its controllers went away).
	pub fn with_driver<F>(make_driver: F) -> Self
	where
		F: Fn(&str) -> D + Send + Sync + 'static,
	{
		Self {
			devices: Mutex::new(HashMap::new()),
			make_driver: Arc::new(make_driver),
		}
	}

	/// Get a handle for the named device.
	///
	/// Succeeds for any non-empty name, whether or not such a device
	/// exists on the system.
	pub fn port(&self, name: &str) -> Result<Port<D>, UsageError> {
		if name.is_empty() {
			return Err(UsageError::new("device name must not be empty"));
		}
		Ok(Port::from_device(self.device(name, None)))
	}

	/// List the serial devices the backend can see.
	///
	/// Also updates the description and hardware ID of the returned
	/// devices.
	pub fn ports(&self) -> io::Result<Vec<Port<D>>> {
		let infos = D::enumerate()?;
		Ok(infos
			.iter()
			.filter(|info| !info.name.is_empty())
			.map(|info| Port::from_device(self.device(&info.name, Some(info))))
			.collect())
	}

	/// Re-read enumeration metadata into the known devices.
	pub fn refresh(&self) -> io::Result<()> {
		let infos = D::enumerate()?;
		let devices = self.devices.lock().unwrap();
		for info in infos {
			if let Some(device) = devices.get(&info.name) {
				device.set_details(info.description, info.hardware_id);
			}
		}
		Ok(())
	}

	fn device(&self, name: &str, info: Option<&DeviceInfo>) -> Arc<Device<D>> {
		let mut devices = self.devices.lock().unwrap();
		if let Some(device) = devices.get(name) {
			if let Some(info) = info {
				device.set_details(info.description.clone(), info.hardware_id.clone());
			}
			return device.clone();
		}
		let device = Device::new(
			name.to_string(),
			info.map_or_else(String::new, |info| info.description.clone()),
			info.map_or_else(String::new, |info| info.hardware_id.clone()),
			self.make_driver.clone(),
		);
		devices.insert(name.to_string(), device.clone());
		device
	}
}

#[cfg(feature = "serial2")]
impl PortRegistry<crate::SerialPortDriver> {
	/// The process wide registry over the `serial2` backend.
	///
	/// Created on first use and never torn down.
	pub fn global() -> &'static Self {
		use std::sync::OnceLock;
		static GLOBAL: OnceLock<PortRegistry<crate::SerialPortDriver>> = OnceLock::new();
		GLOBAL.get_or_init(|| Self::with_driver(|path: &str| crate::SerialPortDriver::new(path)))
	}
}
