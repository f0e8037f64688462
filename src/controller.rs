//! The base building blocks for serial port controllers.
//!
//! A controller is any object that wants to drive the port: it implements
//! the [`Controller`] trait for its lifecycle callbacks and embeds a
//! [`ControllerCore`] for everything else (management calls, forwarded port
//! operations, delegate registration, transition utilities).
//!
//! Controllers are built as `Arc`s so the access can refer to them:
//!
//! ```no_run
//! use std::sync::Arc;
//! use portshare::{Controller, ControllerCore, Port, SerialPortDriver};
//!
//! struct Probe {
//! 	core: ControllerCore<SerialPortDriver>,
//! }
//!
//! impl Controller<SerialPortDriver> for Probe {
//! 	fn core(&self) -> &ControllerCore<SerialPortDriver> {
//! 		&self.core
//! 	}
//!
//! 	fn kind(&self) -> &'static str {
//! 		"Probe"
//! 	}
//! }
//!
//! let port = Port::new("/dev/ttyUSB0")?;
//! let probe = Arc::new_cyclic(|weak: &std::sync::Weak<Probe>| Probe {
//! 	core: ControllerCore::new(port, weak.clone()),
//! });
//! probe.core().make_active()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::access::Access;
use crate::device::Port;
use crate::driver::{SerialDriver, Settings};
use crate::error::{AccessError, Refused, TransitionError, UsageError};

/// How long the default `will_make_inactive` waits for in-flight port
/// operations to return before refusing the transition.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(1500);

/// A serial port controller.
///
/// The trait consists of the transition callbacks. All of them have usable
/// defaults; a controller that does not delegate and does not need to veto
/// or observe transitions only has to provide [`Self::core`] and
/// [`Self::kind`].
///
/// Callbacks are invoked on the thread that requested the transition, and
/// callbacks for one transition are strictly ordered. The fallible
/// callbacks cancel the transition by returning an error; the infallible
/// ones cannot fail by construction.
pub trait Controller<D: SerialDriver>: Send + Sync + 'static {
	/// The controller's base state.
	fn core(&self) -> &ControllerCore<D>;

	/// The type of the controller, typically the type name.
	fn kind(&self) -> &'static str;

	/// A description of the controller for error messages and logs.
	fn describe(&self) -> String {
		format!(
			"{} for '{}' ({:#x})",
			self.kind(),
			self.core().device_name(),
			self.core().id().address(),
		)
	}

	/// How long the default [`Self::will_make_inactive`] waits for the
	/// drain before refusing.
	fn drain_timeout(&self) -> Duration {
		DEFAULT_DRAIN_TIMEOUT
	}

	/// Called before the controller is removed from the access list.
	///
	/// Return an error to cancel the change; it propagates to the call
	/// that requested it. The current controller is notified first, the
	/// rest of the access list in unspecified order. If this returns
	/// normally, either [`Self::did_remove`] or [`Self::did_cancel_remove`]
	/// follows.
	///
	/// Active controller changes for members of the access list are
	/// allowed from inside this callback, current controller changes are
	/// not.
	fn will_remove(&self) -> Result<(), TransitionError> {
		Ok(())
	}

	/// Called after [`Self::will_remove`] when the change was cancelled.
	fn did_cancel_remove(&self) {}

	/// Called after the controller left the access list.
	fn did_remove(&self) {}

	/// Called after the controller joined the access list.
	///
	/// Runs before `did_make_active` when the controller is added and made
	/// active in one step.
	fn did_add(&self) {}

	/// Called when the controller is about to lose the active role.
	///
	/// This is the one callback with obligations: it must block access
	/// calls and wait until all of them have returned, or return an error
	/// to refuse the change. Returning without draining fails the
	/// transition with a usage error and [`Self::did_cancel_make_inactive`]
	/// is called.
	///
	/// The default implementation blocks access calls, waits up to
	/// [`Self::drain_timeout`] and refuses if calls are still outstanding.
	fn will_make_inactive(&self) -> Result<(), TransitionError> {
		self.core().block_access_calls()?;
		if !self.core().wait_for_access_calls_to_return(self.drain_timeout())? {
			return Err(Refused::new(self.describe(), "access calls have not returned").into());
		}
		Ok(())
	}

	/// Called instead of [`Self::did_make_inactive`] when the transition
	/// failed after `will_make_inactive` returned.
	///
	/// Only reachable through an incorrectly implemented
	/// `will_make_inactive`, but part of the state machine all the same.
	fn did_cancel_make_inactive(&self) {}

	/// Called after the controller lost the active role.
	fn did_make_inactive(&self) {}

	/// Called right before the controller gains the active role.
	///
	/// Runs with the access state locked so a controller can keep its own
	/// bookkeeping consistent with the swap. Must not call back into the
	/// access (no port operations, no transition utilities).
	fn will_make_active(&self) {}

	/// Called after the controller gained the active role.
	///
	/// A typical use is applying the controller's preferred port settings.
	/// An error propagates to the caller that requested the change, but
	/// the controller stays active.
	fn did_make_active(&self) -> Result<(), TransitionError> {
		Ok(())
	}
}

/// Identity of a controller, derived from its allocation address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControllerId(usize);

impl ControllerId {
	pub(crate) fn of<D: SerialDriver>(controller: &Arc<dyn Controller<D>>) -> Self {
		Self(Arc::as_ptr(controller) as *const () as usize)
	}

	pub(crate) fn address(self) -> usize {
		self.0
	}
}

/// The base state every controller embeds.
///
/// Holds the port, the shared access object, and the registered delegates.
/// All management calls, transition utilities and forwarded port
/// operations live here.
pub struct ControllerCore<D: SerialDriver> {
	port: Port<D>,
	access: Arc<Access<D>>,

	/// Back reference to the owning controller, used to hand the access a
	/// callback handle.
	this: Weak<dyn Controller<D>>,

	/// The identity of the owning controller, fixed at construction.
	id: ControllerId,

	delegates: Mutex<Delegates<D>>,
}

struct Delegates<D: SerialDriver> {
	list: Vec<Arc<dyn Controller<D>>>,

	/// Set once the list has been used for an access list. Registration is
	/// rejected from then on, so transitions can walk the tree without
	/// holding every lock.
	frozen: bool,
}

impl<D: SerialDriver> ControllerCore<D> {
	/// Create the core for a controller.
	///
	/// Meant to be called from inside [`Arc::new_cyclic`] so the weak back
	/// reference can be handed over before the controller exists:
	/// see the [module docs](self) for the pattern.
	pub fn new(port: Port<D>, this: Weak<impl Controller<D>>) -> Self {
		let access = port.device().access();
		let id = ControllerId(Weak::as_ptr(&this) as *const () as usize);
		Self {
			port,
			access,
			this,
			id,
			delegates: Mutex::new(Delegates {
				list: Vec::new(),
				frozen: false,
			}),
		}
	}

	/// The port this controller belongs to.
	pub fn port(&self) -> &Port<D> {
		&self.port
	}

	/// The name of the serial device.
	pub fn device_name(&self) -> &str {
		self.port.name()
	}

	/// Register a delegate controller.
	///
	/// Delegates share the controller's place in the access list, so the
	/// controller can hand the active role to them without a current
	/// controller change. Registration is allowed only before the
	/// controller is first used; the list is frozen from then on.
	///
	/// Fails if the delegate is the controller itself, was already
	/// registered, or would create a delegation cycle.
	pub fn register_delegate(&self, delegate: Arc<dyn Controller<D>>) -> Result<(), UsageError> {
		let id = ControllerId::of(&delegate);
		if id == self.id() {
			return Err(UsageError::new("a controller cannot delegate to itself"));
		}
		if has_as_delegate_or_subdelegate(&*delegate, self.id()) {
			return Err(UsageError::new("delegation cycles are not allowed"));
		}
		let mut delegates = self.delegates.lock().unwrap();
		if delegates.frozen {
			return Err(UsageError::new(
				"delegates must be registered before the controller is first used",
			));
		}
		if delegates.list.iter().any(|other| ControllerId::of(other) == id) {
			return Err(UsageError::new("cannot register the same delegate twice"));
		}
		delegates.list.push(delegate);
		Ok(())
	}

	/// Check if the controller is the active controller.
	///
	/// In a multithreaded program the answer may be stale by the time it
	/// is used. The only way to stay active for certain is to refuse
	/// transitions in `will_make_inactive` or `will_remove`.
	pub fn is_active(&self) -> bool {
		self.access.is_active_id(self.id())
	}

	/// Check if the controller is the current controller.
	pub fn is_current(&self) -> bool {
		self.access.is_current_id(self.id())
	}

	/// Make the controller the active controller.
	///
	/// Does nothing if it already is. Performs a current controller change
	/// first when the controller is not in the access list.
	pub fn make_active(&self) -> Result<(), TransitionError> {
		self.access.make_active(&self.this_controller()?)
	}

	/// Make the controller inactive.
	///
	/// Does nothing if it is not active. The controller stays in the
	/// access list if it is in it.
	pub fn make_inactive(&self) -> Result<(), TransitionError> {
		self.access.make_inactive(&self.this_controller()?)
	}

	/// Remove the controller and its delegates from the access list.
	///
	/// Does nothing if the controller is not in the list. Fails if the
	/// controller is in the list as a delegate: delegates can only leave
	/// together with their current controller.
	pub fn remove_from_access(&self) -> Result<(), TransitionError> {
		self.access.remove_from_access(&self.this_controller()?)
	}

	/// Remove the controller from the access list if it is the current
	/// controller.
	///
	/// Intended for destructors, where a controller that is merely a
	/// delegate is kept alive by its delegating controller and must stay.
	pub fn remove_if_current(&self) -> Result<(), TransitionError> {
		if !self.is_current() {
			return Ok(());
		}
		self.remove_from_access()
	}

	/// Block access calls made from outside the transition thread.
	///
	/// Callable only from a transition callback or subcall.
	pub fn block_access_calls(&self) -> Result<(), UsageError> {
		self.access.block_access_calls(self)
	}

	/// Unblock access calls.
	///
	/// Callable only from a transition callback or subcall. Access calls
	/// are unblocked automatically when the transition ends.
	pub fn unblock_access_calls(&self) -> Result<(), UsageError> {
		self.access.unblock_access_calls(self)
	}

	/// Wait until all access calls have returned, or the timeout elapses.
	///
	/// Returns true if all calls returned. Callable only from a transition
	/// callback or subcall.
	pub fn wait_for_access_calls_to_return(&self, timeout: Duration) -> Result<bool, UsageError> {
		self.access.wait_for_access_calls_to_return(self, timeout)
	}

	pub(crate) fn id(&self) -> ControllerId {
		self.id
	}

	pub(crate) fn describe_owner(&self) -> String {
		match self.this.upgrade() {
			Some(controller) => controller.describe(),
			None => format!("<controller {:#x}>", self.id().address()),
		}
	}

	fn this_controller(&self) -> Result<Arc<dyn Controller<D>>, UsageError> {
		self.this.upgrade().ok_or_else(|| {
			UsageError::new("the controller is not fully constructed or already being destroyed")
		})
	}

	pub(crate) fn delegates_snapshot(&self) -> Vec<Arc<dyn Controller<D>>> {
		self.delegates.lock().unwrap().list.clone()
	}

	fn freeze_delegates(&self) -> Vec<Arc<dyn Controller<D>>> {
		let mut delegates = self.delegates.lock().unwrap();
		delegates.frozen = true;
		delegates.list.clone()
	}
}

/// The forwarded port operations.
///
/// These fail with [`AccessError::NotActive`] when the controller is not
/// the active controller, and block while a transition has access calls
/// blocked. Everything else is handed to the driver unchanged.
impl<D: SerialDriver> ControllerCore<D> {
	/// Open the port. Fails if it is already open.
	pub fn open(&self) -> Result<(), AccessError> {
		self.access.open(self)
	}

	/// Open the port if it is not already open.
	pub fn ensure_open(&self) -> Result<(), AccessError> {
		self.access.ensure_open(self)
	}

	/// Check if the port is open.
	pub fn is_open(&self) -> Result<bool, AccessError> {
		self.access.is_open(self)
	}

	/// Close the port.
	pub fn close(&self) -> Result<(), AccessError> {
		self.access.close(self)
	}

	/// Get the number of bytes waiting in the input buffer.
	pub fn available(&self) -> Result<usize, AccessError> {
		self.access.available(self)
	}

	/// Read bytes from the port.
	pub fn read(&self, buffer: &mut [u8]) -> Result<usize, AccessError> {
		self.access.read(self, buffer)
	}

	/// Write bytes to the port, returning the number written.
	pub fn write(&self, data: &[u8]) -> Result<usize, AccessError> {
		self.access.write(self, data)
	}

	/// Write all bytes in `data` to the port.
	pub fn write_all(&self, data: &[u8]) -> Result<(), AccessError> {
		self.access.write_all(self, data)
	}

	/// Block until all written data has been transmitted.
	pub fn flush(&self) -> Result<(), AccessError> {
		self.access.flush(self)
	}

	/// Discard the input buffer of the port.
	pub fn discard_input_buffer(&self) -> Result<(), AccessError> {
		self.access.discard_input_buffer(self)
	}

	/// Discard the output buffer of the port.
	pub fn discard_output_buffer(&self) -> Result<(), AccessError> {
		self.access.discard_output_buffer(self)
	}

	pub fn baud_rate(&self) -> Result<u32, AccessError> {
		self.access.baud_rate(self)
	}

	pub fn set_baud_rate(&self, baud_rate: u32) -> Result<(), AccessError> {
		self.access.set_baud_rate(self, baud_rate)
	}

	pub fn char_size(&self) -> Result<crate::CharSize, AccessError> {
		self.access.char_size(self)
	}

	pub fn set_char_size(&self, char_size: crate::CharSize) -> Result<(), AccessError> {
		self.access.set_char_size(self, char_size)
	}

	pub fn parity(&self) -> Result<crate::Parity, AccessError> {
		self.access.parity(self)
	}

	pub fn set_parity(&self, parity: crate::Parity) -> Result<(), AccessError> {
		self.access.set_parity(self, parity)
	}

	pub fn stop_bits(&self) -> Result<crate::StopBits, AccessError> {
		self.access.stop_bits(self)
	}

	pub fn set_stop_bits(&self, stop_bits: crate::StopBits) -> Result<(), AccessError> {
		self.access.set_stop_bits(self, stop_bits)
	}

	pub fn flow_control(&self) -> Result<crate::FlowControl, AccessError> {
		self.access.flow_control(self)
	}

	pub fn set_flow_control(&self, flow_control: crate::FlowControl) -> Result<(), AccessError> {
		self.access.set_flow_control(self, flow_control)
	}

	pub fn read_timeout(&self) -> Result<Duration, AccessError> {
		self.access.read_timeout(self)
	}

	pub fn set_read_timeout(&self, timeout: Duration) -> Result<(), AccessError> {
		self.access.set_read_timeout(self, timeout)
	}

	pub fn write_timeout(&self) -> Result<Duration, AccessError> {
		self.access.write_timeout(self)
	}

	pub fn set_write_timeout(&self, timeout: Duration) -> Result<(), AccessError> {
		self.access.set_write_timeout(self, timeout)
	}

	/// Apply a full set of port settings in one serialized call.
	pub fn apply_settings(&self, settings: &Settings) -> Result<(), AccessError> {
		self.access.apply_settings(self, settings)
	}

	/// Set the state of the RTS (request to send) line.
	pub fn set_rts(&self, state: bool) -> Result<(), AccessError> {
		self.access.set_rts(self, state)
	}

	/// Read the state of the CTS (clear to send) line.
	pub fn read_cts(&self) -> Result<bool, AccessError> {
		self.access.read_cts(self)
	}

	/// Set the state of the DTR (data terminal ready) line.
	pub fn set_dtr(&self, state: bool) -> Result<(), AccessError> {
		self.access.set_dtr(self, state)
	}

	/// Read the state of the DSR (data set ready) line.
	pub fn read_dsr(&self) -> Result<bool, AccessError> {
		self.access.read_dsr(self)
	}

	/// Read the state of the RI (ring indicator) line.
	pub fn read_ri(&self) -> Result<bool, AccessError> {
		self.access.read_ri(self)
	}

	/// Read the state of the CD (carrier detect) line.
	pub fn read_cd(&self) -> Result<bool, AccessError> {
		self.access.read_cd(self)
	}
}

impl<D: SerialDriver> Drop for ControllerCore<D> {
	fn drop(&mut self) {
		// Being dropped while still in the access list is a usage bug:
		// controllers must detach before destruction.
		if self.access.is_listed(self.id()) {
			error!(
				"controller {:#x} for '{}' was dropped while still in the access list",
				self.id().address(),
				self.device_name(),
			);
			debug_assert!(false, "controller dropped while still in the access list");
		}
	}
}

impl<D: SerialDriver> std::fmt::Debug for ControllerCore<D> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ControllerCore")
			.field("device", &self.device_name())
			.field("id", &self.id())
			.finish_non_exhaustive()
	}
}

/// The access list of a controller: the controller itself followed by its
/// delegates in breadth first order (degree 1, then 2, and so on). The
/// order of delegates of the same degree is unspecified.
pub(crate) fn controllers_list<D: SerialDriver>(root: &Arc<dyn Controller<D>>) -> Vec<Arc<dyn Controller<D>>> {
	let mut list = vec![root.clone()];
	let mut degree = 1;
	loop {
		let appended = append_delegates_of_degree(root, &mut list, degree);
		if appended == 0 {
			break;
		}
		degree += 1;
	}
	list
}

fn append_delegates_of_degree<D: SerialDriver>(
	controller: &Arc<dyn Controller<D>>,
	list: &mut Vec<Arc<dyn Controller<D>>>,
	degree: usize,
) -> usize {
	if degree == 0 {
		list.push(controller.clone());
		1
	} else {
		let mut appended = 0;
		for delegate in controller.core().freeze_delegates() {
			appended += append_delegates_of_degree(&delegate, list, degree - 1);
		}
		appended
	}
}

/// Check if `id` identifies a delegate or subdelegate of `controller`.
pub(crate) fn has_as_delegate_or_subdelegate<D: SerialDriver>(controller: &dyn Controller<D>, id: ControllerId) -> bool {
	for delegate in controller.core().delegates_snapshot() {
		if ControllerId::of(&delegate) == id {
			return true;
		}
		if has_as_delegate_or_subdelegate(&*delegate, id) {
			return true;
		}
	}
	false
}
