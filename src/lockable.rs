//! A controller that can lock itself into the active role.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::ThreadId;
use std::time::Duration;

use crate::controller::{Controller, ControllerCore};
use crate::device::Port;
use crate::driver::{SerialDriver, Settings};
use crate::error::{AccessError, Refused, TransitionError};

/// How long a lockable controller waits for its own in-flight port
/// operations to return before refusing to become inactive.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(1000);

/// A serial port controller that can pin itself against preemption.
///
/// A plain active controller loses the active role as soon as another
/// controller asks for it. A locked active controller refuses such
/// requests: [`make_locked_active`][Self::make_locked_active] makes the
/// controller active and locked in one step, and it stays that way until
/// [`unlock_active`][Self::unlock_active] or
/// [`make_inactive`][Self::make_inactive] is called. Making itself
/// inactive always unlocks, locking only ever guards against other
/// controllers.
///
/// The port operations behave like those of any controller: they fail with
/// [`AccessError::NotActive`] while the controller is not active.
pub struct LockableController<D: SerialDriver> {
	inner: Arc<LockableInner<D>>,
}

struct LockableInner<D: SerialDriver> {
	core: ControllerCore<D>,

	/// The lock flags, plus the "held" marker that keeps them pinned for
	/// the duration of a transition.
	gate: LockGate,

	/// The value to give the lock flags when the controller becomes
	/// active: true when requested through `make_locked_active`, false
	/// when requested through `make_active`. Only written under the
	/// management serializing mutex.
	promote_to_locked: AtomicBool,

	/// Serializes the state changing management calls.
	am_serializing: Mutex<()>,

	/// Tracks whether a management call of this controller is in progress
	/// and on which thread, so `will_make_inactive` can tell a
	/// self-initiated transition from an external one.
	am_call: Mutex<AmCall>,
}

#[derive(Default)]
struct AmCall {
	in_progress: bool,
	thread: Option<ThreadId>,
}

/// The lock flags of a lockable controller.
///
/// `locked` decides refusals; it may be set ahead of a promotion so a
/// racing external request is refused right away. `observed_locked_active`
/// backs the user query and only becomes true once the controller is
/// certainly locked and active.
///
/// While `held` is set a transition has the flags pinned: every other
/// access waits, so observers can never see the active state and the lock
/// flags disagree. The transition callbacks take and release the gate on
/// the transition thread.
struct LockGate {
	state: Mutex<GateState>,
	released: Condvar,
}

#[derive(Default)]
struct GateState {
	locked: bool,
	observed_locked_active: bool,
	held: bool,
}

impl LockGate {
	fn new() -> Self {
		Self {
			state: Mutex::new(GateState::default()),
			released: Condvar::new(),
		}
	}

	/// Access the flags once no transition has them pinned.
	fn with<R>(&self, f: impl FnOnce(&mut GateState) -> R) -> R {
		let state = self.state.lock().unwrap();
		let mut state = self.released.wait_while(state, |state| state.held).unwrap();
		f(&mut state)
	}

	/// Pin the flags to the running transition.
	fn hold(&self) {
		self.with(|state| state.held = true);
	}

	/// Update the flags and release the pin.
	fn release(&self, f: impl FnOnce(&mut GateState)) {
		let mut state = self.state.lock().unwrap();
		debug_assert!(state.held);
		f(&mut state);
		state.held = false;
		drop(state);
		self.released.notify_all();
	}
}

/// Scope of one state changing management call.
///
/// Serializes the management calls against each other and records the
/// calling thread so the transition callbacks can recognize self-initiated
/// transitions.
struct AmGuard<'a, D: SerialDriver> {
	inner: &'a LockableInner<D>,
	_serializing: MutexGuard<'a, ()>,
}

impl<'a, D: SerialDriver> AmGuard<'a, D> {
	fn new(inner: &'a LockableInner<D>) -> Self {
		let serializing = inner.am_serializing.lock().unwrap();
		let mut call = inner.am_call.lock().unwrap();
		call.in_progress = true;
		call.thread = Some(std::thread::current().id());
		drop(call);
		Self {
			inner,
			_serializing: serializing,
		}
	}
}

impl<D: SerialDriver> Drop for AmGuard<'_, D> {
	fn drop(&mut self) {
		self.inner.am_call.lock().unwrap().in_progress = false;
	}
}

impl<D: SerialDriver> LockableController<D> {
	/// Create a controller for the given port.
	pub fn new(port: Port<D>) -> Self {
		let inner = Arc::new_cyclic(|weak: &std::sync::Weak<LockableInner<D>>| LockableInner {
			core: ControllerCore::new(port, weak.clone()),
			gate: LockGate::new(),
			promote_to_locked: AtomicBool::new(false),
			am_serializing: Mutex::new(()),
			am_call: Mutex::new(AmCall::default()),
		});
		Self { inner }
	}

	/// The port this controller belongs to.
	pub fn port(&self) -> &Port<D> {
		self.inner.core.port()
	}

	/// The controller as a callback handle, for delegate registration.
	pub fn as_controller(&self) -> Arc<dyn Controller<D>> {
		self.inner.clone()
	}

	/// Check if the controller is active.
	///
	/// Unless the controller is locked, it may become inactive at any
	/// time, including between this call and the use of its answer.
	pub fn is_active(&self) -> bool {
		self.inner.core.is_active()
	}

	/// Check if the controller is locked active.
	///
	/// Locked active means active and refusing to give the role up until
	/// [`Self::unlock_active`] or [`Self::make_inactive`].
	pub fn is_locked_active(&self) -> bool {
		self.inner.gate.with(|state| state.observed_locked_active)
	}

	/// Make the controller active, unlocked.
	///
	/// Does nothing if the controller is already active; in particular a
	/// locked active controller stays locked.
	pub fn make_active(&self) -> Result<(), TransitionError> {
		let _guard = AmGuard::new(&self.inner);
		self.inner.promote_to_locked.store(false, Ordering::SeqCst);
		self.inner.core.make_active()
	}

	/// Make the controller locked active.
	///
	/// On success the controller is active and refuses all external
	/// requests to give the role up. On failure the controller state is
	/// unchanged.
	pub fn make_locked_active(&self) -> Result<(), TransitionError> {
		let _guard = AmGuard::new(&self.inner);
		self.inner.promote_to_locked.store(true, Ordering::SeqCst);

		// Locking ahead of the request makes a racing external request
		// fail immediately. If the controller was already active there is
		// no transition and this pre-set is the locking itself.
		self.inner.gate.with(|state| state.locked = true);

		if let Err(e) = self.inner.core.make_active() {
			if !self.inner.core.is_active() {
				self.inner.gate.with(|state| state.locked = false);
			}
			return Err(e);
		}

		self.inner.gate.with(|state| state.observed_locked_active = true);
		Ok(())
	}

	/// Make the controller inactive, unlocking it if necessary.
	///
	/// The lock only guards against other controllers; the controller's
	/// own request is honored, and on success the lock is released. On
	/// failure the state, including the lock, is unchanged.
	pub fn make_inactive(&self) -> Result<(), TransitionError> {
		let _guard = AmGuard::new(&self.inner);
		self.inner.core.make_inactive()
	}

	/// Release the lock without giving up the active role.
	///
	/// After unlocking the controller may become inactive at any time.
	/// Does nothing if the controller is not locked.
	pub fn unlock_active(&self) {
		let _guard = AmGuard::new(&self.inner);
		self.inner.gate.with(|state| {
			state.locked = false;
			state.observed_locked_active = false;
		});
	}

	/// Remove the controller from the access list.
	///
	/// Implies making it inactive first, honoring the same self-initiated
	/// exemption from the lock as [`Self::make_inactive`].
	pub fn remove_from_access(&self) -> Result<(), TransitionError> {
		let _guard = AmGuard::new(&self.inner);
		self.inner.core.remove_from_access()
	}
}

/// The port operations, forwarded to the shared access.
impl<D: SerialDriver> LockableController<D> {
	/// Open the port. Fails if it is already open.
	pub fn open(&self) -> Result<(), AccessError> {
		self.inner.core.open()
	}

	/// Open the port if it is not already open.
	pub fn ensure_open(&self) -> Result<(), AccessError> {
		self.inner.core.ensure_open()
	}

	/// Check if the port is open.
	pub fn is_open(&self) -> Result<bool, AccessError> {
		self.inner.core.is_open()
	}

	/// Close the port.
	pub fn close(&self) -> Result<(), AccessError> {
		self.inner.core.close()
	}

	/// Get the number of bytes waiting in the input buffer.
	pub fn available(&self) -> Result<usize, AccessError> {
		self.inner.core.available()
	}

	/// Read bytes from the port.
	pub fn read(&self, buffer: &mut [u8]) -> Result<usize, AccessError> {
		self.inner.core.read(buffer)
	}

	/// Write bytes to the port, returning the number written.
	pub fn write(&self, data: &[u8]) -> Result<usize, AccessError> {
		self.inner.core.write(data)
	}

	/// Write all bytes in `data` to the port.
	pub fn write_all(&self, data: &[u8]) -> Result<(), AccessError> {
		self.inner.core.write_all(data)
	}

	/// Block until all written data has been transmitted.
	pub fn flush(&self) -> Result<(), AccessError> {
		self.inner.core.flush()
	}

	/// Discard the input buffer of the port.
	pub fn discard_input_buffer(&self) -> Result<(), AccessError> {
		self.inner.core.discard_input_buffer()
	}

	/// Discard the output buffer of the port.
	pub fn discard_output_buffer(&self) -> Result<(), AccessError> {
		self.inner.core.discard_output_buffer()
	}

	pub fn baud_rate(&self) -> Result<u32, AccessError> {
		self.inner.core.baud_rate()
	}

	pub fn set_baud_rate(&self, baud_rate: u32) -> Result<(), AccessError> {
		self.inner.core.set_baud_rate(baud_rate)
	}

	pub fn char_size(&self) -> Result<crate::CharSize, AccessError> {
		self.inner.core.char_size()
	}

	pub fn set_char_size(&self, char_size: crate::CharSize) -> Result<(), AccessError> {
		self.inner.core.set_char_size(char_size)
	}

	pub fn parity(&self) -> Result<crate::Parity, AccessError> {
		self.inner.core.parity()
	}

	pub fn set_parity(&self, parity: crate::Parity) -> Result<(), AccessError> {
		self.inner.core.set_parity(parity)
	}

	pub fn stop_bits(&self) -> Result<crate::StopBits, AccessError> {
		self.inner.core.stop_bits()
	}

	pub fn set_stop_bits(&self, stop_bits: crate::StopBits) -> Result<(), AccessError> {
		self.inner.core.set_stop_bits(stop_bits)
	}

	pub fn flow_control(&self) -> Result<crate::FlowControl, AccessError> {
		self.inner.core.flow_control()
	}

	pub fn set_flow_control(&self, flow_control: crate::FlowControl) -> Result<(), AccessError> {
		self.inner.core.set_flow_control(flow_control)
	}

	pub fn read_timeout(&self) -> Result<Duration, AccessError> {
		self.inner.core.read_timeout()
	}

	pub fn set_read_timeout(&self, timeout: Duration) -> Result<(), AccessError> {
		self.inner.core.set_read_timeout(timeout)
	}

	pub fn write_timeout(&self) -> Result<Duration, AccessError> {
		self.inner.core.write_timeout()
	}

	pub fn set_write_timeout(&self, timeout: Duration) -> Result<(), AccessError> {
		self.inner.core.set_write_timeout(timeout)
	}

	/// Apply a full set of port settings in one serialized call.
	pub fn apply_settings(&self, settings: &Settings) -> Result<(), AccessError> {
		self.inner.core.apply_settings(settings)
	}

	/// Set the state of the RTS (request to send) line.
	pub fn set_rts(&self, state: bool) -> Result<(), AccessError> {
		self.inner.core.set_rts(state)
	}

	/// Read the state of the CTS (clear to send) line.
	pub fn read_cts(&self) -> Result<bool, AccessError> {
		self.inner.core.read_cts()
	}

	/// Set the state of the DTR (data terminal ready) line.
	pub fn set_dtr(&self, state: bool) -> Result<(), AccessError> {
		self.inner.core.set_dtr(state)
	}

	/// Read the state of the DSR (data set ready) line.
	pub fn read_dsr(&self) -> Result<bool, AccessError> {
		self.inner.core.read_dsr()
	}

	/// Read the state of the RI (ring indicator) line.
	pub fn read_ri(&self) -> Result<bool, AccessError> {
		self.inner.core.read_ri()
	}

	/// Read the state of the CD (carrier detect) line.
	pub fn read_cd(&self) -> Result<bool, AccessError> {
		self.inner.core.read_cd()
	}
}

#[cfg(feature = "serial2")]
impl LockableController<crate::SerialPortDriver> {
	/// Create a controller for the named device, using the global
	/// registry.
	///
	/// Fails if `name` is empty.
	pub fn for_device(name: &str) -> Result<Self, crate::UsageError> {
		Ok(Self::new(crate::PortRegistry::global().port(name)?))
	}
}

impl<D: SerialDriver> Drop for LockableController<D> {
	fn drop(&mut self) {
		// A controller that is merely a delegate is kept alive by its
		// delegating controller and must stay in the list.
		if !self.inner.core.is_current() {
			return;
		}
		if let Err(first) = self.remove_from_access() {
			// A refused drain usually means a stuck read or write;
			// closing the port makes it return.
			let _ = self.inner.core.close();
			if let Err(second) = self.remove_from_access() {
				error!(
					"failed to detach controller from '{}': {} (and again after closing the port: {})",
					self.inner.core.device_name(),
					first,
					second,
				);
			}
		}
	}
}

impl<D: SerialDriver> std::fmt::Debug for LockableController<D> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LockableController")
			.field("device", &self.inner.core.device_name())
			.field("active", &self.is_active())
			.field("locked_active", &self.is_locked_active())
			.finish()
	}
}

impl<D: SerialDriver> LockableInner<D> {
	/// Check if the transition calling back was initiated by another
	/// controller rather than a management call of this one.
	fn transition_initiated_externally(&self) -> bool {
		let call = self.am_call.lock().unwrap();
		!call.in_progress || call.thread != Some(std::thread::current().id())
	}
}

impl<D: SerialDriver> Controller<D> for LockableInner<D> {
	fn core(&self) -> &ControllerCore<D> {
		&self.core
	}

	fn kind(&self) -> &'static str {
		"LockableController"
	}

	fn drain_timeout(&self) -> Duration {
		DRAIN_TIMEOUT
	}

	fn will_make_inactive(&self) -> Result<(), TransitionError> {
		// An external request is refused while locked. The controller's
		// own requests ignore the lock; it is released in
		// did_make_inactive once the transition goes through.
		if self.transition_initiated_externally() {
			let locked = self.gate.with(|state| state.locked);
			if locked {
				return Err(Refused::new(self.describe(), "the controller is locked").into());
			}
		}

		self.core.block_access_calls()?;
		if !self.core.wait_for_access_calls_to_return(self.drain_timeout())? {
			return Err(Refused::new(self.describe(), "the controller is using the port").into());
		}

		// Pin the lock flags to the transition. Released in
		// did_make_inactive or did_cancel_make_inactive.
		self.gate.hold();
		Ok(())
	}

	fn did_make_inactive(&self) {
		// The flags must never be set while the controller is inactive.
		self.gate.release(|state| {
			state.locked = false;
			state.observed_locked_active = false;
		});
	}

	fn did_cancel_make_inactive(&self) {
		self.gate.release(|_| ());
	}

	fn will_make_active(&self) {
		// Pin the lock flags so they cannot be observed out of sync with
		// the active state while transitioning to locked active.
		// Released in did_make_active.
		self.gate.hold();
	}

	fn did_make_active(&self) -> Result<(), TransitionError> {
		// The management calls are serialized, so the promote flag still
		// holds the value set by the call that caused this activation. An
		// activation that bypassed them never promotes to locked.
		let promote = !self.transition_initiated_externally()
			&& self.promote_to_locked.load(Ordering::SeqCst);
		self.gate.release(|state| {
			state.locked = promote;
			state.observed_locked_active = promote;
		});
		Ok(())
	}
}
