//! Devices and port handles.

use std::sync::{Arc, Mutex, Weak};

use crate::access::Access;
use crate::controller::Controller;
use crate::driver::SerialDriver;

/// A lightweight handle for a serial port.
///
/// A `Port` represents a device, identified by its name. Handles for the
/// same name obtained from the same registry refer to the same device.
/// Holding a `Port` does not mean the device is present or usable; actually
/// driving the port is done through a controller.
///
/// Cloning is cheap and clones compare equal.
pub struct Port<D: SerialDriver> {
	device: Arc<Device<D>>,
}

impl<D: SerialDriver> Port<D> {
	pub(crate) fn from_device(device: Arc<Device<D>>) -> Self {
		Self { device }
	}

	/// The name of the serial device, such as `/dev/ttyUSB0` or `COM3`.
	pub fn name(&self) -> &str {
		&self.device.name
	}

	/// A description of the device, as reported by enumeration.
	///
	/// Empty if the device has not been enumerated or the backend does not
	/// report one.
	pub fn description(&self) -> String {
		self.device.details.lock().unwrap().description.clone()
	}

	/// The hardware ID of the device, as reported by enumeration.
	///
	/// Empty if the device has not been enumerated or the backend does not
	/// report one.
	pub fn hardware_id(&self) -> String {
		self.device.details.lock().unwrap().hardware_id.clone()
	}

	/// The controller currently heading the access list, if any.
	///
	/// The answer may be stale by the time it is used: another thread can
	/// change the current controller at any moment.
	pub fn current_controller(&self) -> Option<Arc<dyn Controller<D>>> {
		self.device.current_controller()
	}

	pub(crate) fn device(&self) -> &Arc<Device<D>> {
		&self.device
	}
}

#[cfg(feature = "serial2")]
impl Port<crate::SerialPortDriver> {
	/// Get a handle for the named device from the global registry.
	///
	/// Fails if `name` is empty.
	pub fn new(name: &str) -> Result<Self, crate::UsageError> {
		crate::PortRegistry::global().port(name)
	}
}

impl<D: SerialDriver> Clone for Port<D> {
	fn clone(&self) -> Self {
		Self {
			device: self.device.clone(),
		}
	}
}

impl<D: SerialDriver> PartialEq for Port<D> {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.device, &other.device)
	}
}

impl<D: SerialDriver> Eq for Port<D> {}

impl<D: SerialDriver> std::fmt::Debug for Port<D> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Port").field("name", &self.name()).finish()
	}
}

/// The unique object behind all port handles with the same name.
///
/// The device keeps only a weak reference to its access object: the access
/// is owned by the controllers, created on the first attach and destroyed
/// when the last controller goes away. A later attach creates a fresh one.
pub(crate) struct Device<D: SerialDriver> {
	name: String,
	details: Mutex<DeviceDetails>,
	access: Mutex<Weak<Access<D>>>,
	make_driver: Arc<dyn Fn(&str) -> D + Send + Sync>,
}

#[derive(Default)]
struct DeviceDetails {
	description: String,
	hardware_id: String,
}

impl<D: SerialDriver> Device<D> {
	pub(crate) fn new(
		name: String,
		description: String,
		hardware_id: String,
		make_driver: Arc<dyn Fn(&str) -> D + Send + Sync>,
	) -> Arc<Self> {
		Arc::new(Self {
			name,
			details: Mutex::new(DeviceDetails {
				description,
				hardware_id,
			}),
			access: Mutex::new(Weak::new()),
			make_driver,
		})
	}

	/// The shared access object for the device, created if necessary.
	pub(crate) fn access(&self) -> Arc<Access<D>> {
		let mut weak = self.access.lock().unwrap();
		if let Some(access) = weak.upgrade() {
			return access;
		}
		trace!("creating access for '{}'", self.name);
		let access = Access::new(self.name.clone(), (self.make_driver)(&self.name));
		*weak = Arc::downgrade(&access);
		access
	}

	pub(crate) fn set_details(&self, description: String, hardware_id: String) {
		let mut details = self.details.lock().unwrap();
		details.description = description;
		details.hardware_id = hardware_id;
	}

	fn current_controller(&self) -> Option<Arc<dyn Controller<D>>> {
		self.access.lock().unwrap().upgrade()?.snapshot_current()
	}
}
