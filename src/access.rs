//! The per-device arbitration core.
//!
//! One [`Access`] object exists per serial device while any controller for
//! that device is alive. It owns the driver and mediates all traffic: only
//! the active controller may issue port operations, and changes of the
//! active or current controller are serialized through a FIFO transition
//! queue with a cooperative drain of in-flight calls before every hand-off.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use crate::controller::{self, Controller, ControllerCore, ControllerId};
use crate::driver::{SerialDriver, Settings};
use crate::error::{AccessError, NotActive, TransitionError, UsageError};

/// Arbitrates use of one serial device between its controllers.
///
/// Owned by the controllers through `Arc`, the device object only keeps a
/// weak reference. When the last controller goes away the access and its
/// driver are destroyed.
pub(crate) struct Access<D: SerialDriver> {
	device_name: String,

	/// The wrapped driver. Only touched from inside an [`AccessCallGuard`].
	driver: D,

	/// All `state` fields, plus both condition variables below.
	state: Mutex<AccessState<D>>,

	/// Signalled when blocked access calls may re-check their predicate.
	/// Pairs with `state`.
	access_unblocked: Condvar,

	/// Signalled when the last outstanding access call returns.
	/// Pairs with `state`.
	all_calls_returned: Condvar,

	/// Serializes configuration calls so concurrent reconfiguration cannot
	/// interleave. Long running calls (read, write, flush) do not take it.
	config_mutex: Mutex<()>,

	/// Whether an active controller change may run concurrently with the
	/// current controller change in progress. Meaningful only while a
	/// transition is in progress. Atomic so the current-change path can
	/// flip it around the callbacks without relocking `state`.
	concurrent_swap_allowed: AtomicBool,

	// Identities of the active and current controller, readable without
	// the state mutex. 0 means vacant.
	active_id: AtomicUsize,
	current_id: AtomicUsize,

	/// Transition queue tickets. Disjoint from `state`.
	queue: Mutex<TransitionQueue>,

	/// Signalled when `ready_ticket` advances. Pairs with `queue`.
	queue_ready: Condvar,
}

struct AccessState<D: SerialDriver> {
	/// The root of the access list, if any.
	current: Option<ControllerSlot<D>>,

	/// The controller allowed to use the port, if any. Always a member of
	/// the current controller's access list.
	active: Option<ControllerSlot<D>>,

	/// Number of access calls currently executing against the driver.
	unreturned_calls: usize,

	/// When false, access calls from outside the transition thread wait.
	access_is_unblocked: bool,

	transition_in_progress: bool,

	/// The thread driving the transition. Meaningful only while
	/// `transition_in_progress` is set.
	transition_thread: Option<ThreadId>,
}

/// A controller as stored by the access: its identity plus a weak handle.
///
/// The handle is weak so that the access does not keep controllers alive.
/// A controller must leave the access list before it is dropped; a slot
/// whose handle no longer upgrades is a caller bug and is reported.
struct ControllerSlot<D: SerialDriver> {
	id: ControllerId,
	controller: Weak<dyn Controller<D>>,
}

impl<D: SerialDriver> ControllerSlot<D> {
	fn of(controller: &Arc<dyn Controller<D>>) -> Self {
		Self {
			id: ControllerId::of(controller),
			controller: Arc::downgrade(controller),
		}
	}
}

struct TransitionQueue {
	/// The ticket whose holder may run its transition.
	ready_ticket: u64,

	/// The next ticket to hand out.
	next_ticket: u64,
}

impl<D: SerialDriver> Access<D> {
	pub(crate) fn new(device_name: String, driver: D) -> Arc<Self> {
		Arc::new(Self {
			device_name,
			driver,
			state: Mutex::new(AccessState {
				current: None,
				active: None,
				unreturned_calls: 0,
				access_is_unblocked: true,
				transition_in_progress: false,
				transition_thread: None,
			}),
			access_unblocked: Condvar::new(),
			all_calls_returned: Condvar::new(),
			config_mutex: Mutex::new(()),
			concurrent_swap_allowed: AtomicBool::new(false),
			active_id: AtomicUsize::new(0),
			current_id: AtomicUsize::new(0),
			queue: Mutex::new(TransitionQueue {
				ready_ticket: 0,
				next_ticket: 0,
			}),
			queue_ready: Condvar::new(),
		})
	}

	/// Check if the controller is the active controller.
	///
	/// Lock free snapshot, the answer may be stale by the time it is used.
	pub(crate) fn is_active_id(&self, id: ControllerId) -> bool {
		self.active_id.load(Ordering::Relaxed) == id.address()
	}

	pub(crate) fn is_current_id(&self, id: ControllerId) -> bool {
		self.current_id.load(Ordering::Relaxed) == id.address()
	}

	/// Ensure the controller is the active controller.
	///
	/// Performs an active controller change if the controller is already in
	/// the access list, and a current controller change otherwise.
	pub(crate) fn make_active(&self, controller: &Arc<dyn Controller<D>>) -> Result<(), TransitionError> {
		let id = ControllerId::of(controller);
		if self.should_perform_concurrent_swap(id) {
			// Only the transition thread can satisfy the fast path check,
			// so the active controller cannot change underneath us even
			// though the state mutex is no longer held.
			if !self.is_active_id(id) {
				self.perform_active_change(Some(controller))?;
			}
			Ok(())
		} else {
			let _transition = TransitionTicket::acquire(self);
			// The kind of change required can only be determined after
			// waiting in the queue, the access list may have changed.
			if self.is_in_access_list(id) {
				if !self.is_active_id(id) {
					self.perform_active_change(Some(controller))?;
				}
				Ok(())
			} else {
				self.perform_current_change(Some(controller))
			}
		}
	}

	/// Ensure the controller is not the active controller.
	///
	/// Never changes the access list.
	pub(crate) fn make_inactive(&self, controller: &Arc<dyn Controller<D>>) -> Result<(), TransitionError> {
		let id = ControllerId::of(controller);
		if self.should_perform_concurrent_swap(id) {
			if self.is_active_id(id) {
				self.perform_active_change(None)?;
			}
			Ok(())
		} else {
			let _transition = TransitionTicket::acquire(self);
			if self.is_active_id(id) {
				self.perform_active_change(None)?;
			}
			Ok(())
		}
	}

	/// Ensure the controller is not in the access list.
	///
	/// A no-op if the controller is not in the list. Removing a controller
	/// that is in the list as a delegate is an error: delegates can only
	/// leave together with their current controller.
	pub(crate) fn remove_from_access(&self, controller: &Arc<dyn Controller<D>>) -> Result<(), TransitionError> {
		let id = ControllerId::of(controller);
		// A removal always changes the current controller, so it always
		// takes the queue.
		let _transition = TransitionTicket::acquire(self);
		if !self.is_in_access_list(id) {
			return Ok(());
		}
		if self.is_current_id(id) {
			self.perform_current_change(None)
		} else {
			Err(UsageError::new(format!(
				"cannot remove {} from the access, it is a delegate of the current controller",
				controller.describe(),
			))
			.into())
		}
	}

	/// An upgraded snapshot of the current controller.
	pub(crate) fn snapshot_current(&self) -> Option<Arc<dyn Controller<D>>> {
		let state = self.state.lock().unwrap();
		let slot = state.current.as_ref()?;
		slot.controller.upgrade()
	}

	/// Check if the controller is in the access list, for drop checks.
	pub(crate) fn is_listed(&self, id: ControllerId) -> bool {
		self.is_in_access_list(id)
	}

	fn is_in_access_list(&self, id: ControllerId) -> bool {
		let state = self.state.lock().unwrap();
		self.is_in_access_list_locked(&state, id)
	}

	fn is_in_access_list_locked(&self, state: &AccessState<D>, id: ControllerId) -> bool {
		let Some(current) = &state.current else {
			return false;
		};
		if current.id == id {
			return true;
		}
		let Some(current) = current.controller.upgrade() else {
			error!(
				"the current controller of '{}' was dropped while still registered",
				self.device_name,
			);
			return false;
		};
		controller::has_as_delegate_or_subdelegate(&*current, id)
	}

	/// Check if an active controller change must bypass the queue.
	///
	/// Returns true only for a change requested from the `will_remove` or
	/// `did_cancel_remove` callbacks of a current controller change, on the
	/// transition thread, for a controller in the access list. The answer
	/// stays valid after the mutex is released: every variable involved is
	/// only written by the transition thread, and a thread that is not the
	/// transition thread cannot become it except by its own action.
	fn should_perform_concurrent_swap(&self, id: ControllerId) -> bool {
		let state = self.state.lock().unwrap();
		state.transition_in_progress
			&& self.concurrent_swap_allowed.load(Ordering::SeqCst)
			&& state.transition_thread == Some(std::thread::current().id())
			&& self.is_in_access_list_locked(&state, id)
	}

	/// Change the active controller without touching the access list.
	///
	/// A non-vacant new controller must already be in the access list.
	fn perform_active_change(&self, new_active: Option<&Arc<dyn Controller<D>>>) -> Result<(), TransitionError> {
		let _unblocker = AccessUnblocker::new(self);
		self.perform_transition(new_active, false)?;
		if let Some(new_active) = new_active {
			// May fail, the error propagates but the controller stays
			// active.
			new_active.did_make_active()?;
		}
		Ok(())
	}

	/// Replace the current controller, notifying both access lists.
	///
	/// Never runs concurrently: every caller holds a transition ticket.
	fn perform_current_change(&self, new_current: Option<&Arc<dyn Controller<D>>>) -> Result<(), TransitionError> {
		let _unblocker = AccessUnblocker::new(self);

		let old_access_list = match self.snapshot_current() {
			Some(current) => controller::controllers_list(&current),
			None => Vec::new(),
		};

		// Concurrent active controller changes are allowed around the
		// will_remove and did_cancel_remove callbacks and nowhere else.
		self.concurrent_swap_allowed.store(true, Ordering::SeqCst);

		let mut notified = 0;
		let mut refusal = None;
		for controller in &old_access_list {
			match controller.will_remove() {
				Ok(()) => notified += 1,
				Err(e) => {
					refusal = Some(e);
					break;
				},
			}
		}

		let result = match refusal {
			Some(e) => Err(e),
			None => {
				self.concurrent_swap_allowed.store(false, Ordering::SeqCst);
				self.perform_transition(new_current, true)
			},
		};

		if let Err(e) = result {
			// Needed again if the failure came from will_make_inactive,
			// redundant but harmless if it came from will_remove.
			self.concurrent_swap_allowed.store(true, Ordering::SeqCst);
			for controller in old_access_list[..notified].iter().rev() {
				controller.did_cancel_remove();
			}
			return Err(e);
		}

		for controller in &old_access_list {
			controller.did_remove();
		}

		if let Some(new_current) = new_current {
			// did_add runs leaf first: highest degree delegates down to
			// the new current controller.
			let new_access_list = controller::controllers_list(new_current);
			for controller in new_access_list.iter().rev() {
				controller.did_add();
			}
			debug!(
				"'{}': current controller is now {}",
				self.device_name,
				new_current.describe(),
			);
			new_current.did_make_active()?;
		} else {
			debug!("'{}': current controller slot is now vacant", self.device_name);
		}
		Ok(())
	}

	/// Drain the old active controller and swap in the new one.
	///
	/// The active and current controller are only ever written here. The
	/// caller either holds a transition ticket or runs on the transition
	/// thread of the current controller change, so this function never runs
	/// concurrently and the snapshot below stays valid while the state
	/// mutex is unlocked.
	fn perform_transition(
		&self,
		new_controller: Option<&Arc<dyn Controller<D>>>,
		also_set_current: bool,
	) -> Result<(), TransitionError> {
		let old_active = self.snapshot_active();

		if let Some(old_active) = &old_active {
			// Contract: the callback must block access calls and wait
			// until all of them have returned, or fail to refuse.
			old_active.will_make_inactive()?;
		}

		let mut state = self.state.lock().unwrap();

		// The swap is only safe once access calls are blocked and none are
		// outstanding. A violation with an outgoing controller present
		// means its will_make_inactive is buggy.
		let mut fault = None;
		if state.access_is_unblocked {
			match &old_active {
				Some(old_active) => {
					fault = Some(format!(
						"access calls must be blocked in will_make_inactive, controller: {}",
						old_active.describe(),
					));
				},
				None => state.access_is_unblocked = false,
			}
		}
		if fault.is_none() && state.unreturned_calls > 0 {
			fault = Some(match &old_active {
				Some(old_active) => format!(
					"{} access calls have not returned after will_make_inactive, controller: {}",
					state.unreturned_calls,
					old_active.describe(),
				),
				None => format!(
					"{} access calls have not returned for a vacant active slot",
					state.unreturned_calls,
				),
			});
		}
		if let Some(message) = fault {
			drop(state);
			if let Some(old_active) = &old_active {
				old_active.did_cancel_make_inactive();
			}
			return Err(UsageError::new(message).into());
		}

		if let Some(new_controller) = new_controller {
			// Runs with the state mutex held so a controller can pin its
			// own bookkeeping to the swap. Must not call back into the
			// access.
			new_controller.will_make_active();
		}

		state.active = new_controller.map(ControllerSlot::of);
		self.active_id
			.store(new_controller.map_or(0, |c| ControllerId::of(c).address()), Ordering::Relaxed);
		if also_set_current {
			state.current = new_controller.map(ControllerSlot::of);
			self.current_id
				.store(new_controller.map_or(0, |c| ControllerId::of(c).address()), Ordering::Relaxed);
		}
		drop(state);

		trace!(
			"'{}': active controller is now {}",
			self.device_name,
			match new_controller {
				Some(c) => c.describe(),
				None => String::from("vacant"),
			},
		);

		if let Some(old_active) = &old_active {
			old_active.did_make_inactive();
		}
		Ok(())
	}

	fn snapshot_active(&self) -> Option<Arc<dyn Controller<D>>> {
		let state = self.state.lock().unwrap();
		let slot = state.active.as_ref()?;
		let controller = slot.controller.upgrade();
		if controller.is_none() {
			error!(
				"the active controller of '{}' was dropped while still registered",
				self.device_name,
			);
		}
		controller
	}
}

/// Transition utilities, callable only from transition callbacks.
impl<D: SerialDriver> Access<D> {
	/// Block access calls made from outside the transition thread.
	pub(crate) fn block_access_calls(&self, caller: &ControllerCore<D>) -> Result<(), UsageError> {
		let mut state = self.state.lock().unwrap();
		self.check_transition_context(&state, caller, "block_access_calls")?;
		self.check_caller_active(&state, caller, "block_access_calls")?;
		state.access_is_unblocked = false;
		Ok(())
	}

	/// Unblock access calls.
	///
	/// Access calls are also unblocked automatically when the transition
	/// ends, whether it completed or was cancelled.
	pub(crate) fn unblock_access_calls(&self, caller: &ControllerCore<D>) -> Result<(), UsageError> {
		let mut state = self.state.lock().unwrap();
		self.check_transition_context(&state, caller, "unblock_access_calls")?;
		self.check_caller_active(&state, caller, "unblock_access_calls")?;
		state.access_is_unblocked = true;
		drop(state);
		self.access_unblocked.notify_all();
		Ok(())
	}

	/// Wait until all access calls have returned or the timeout elapses.
	///
	/// Returns true if all calls returned. Only meaningful after
	/// [`Self::block_access_calls`], otherwise new calls may start at any
	/// time.
	pub(crate) fn wait_for_access_calls_to_return(
		&self,
		caller: &ControllerCore<D>,
		timeout: Duration,
	) -> Result<bool, UsageError> {
		let state = self.state.lock().unwrap();
		self.check_transition_context(&state, caller, "wait_for_access_calls_to_return")?;
		self.check_caller_active(&state, caller, "wait_for_access_calls_to_return")?;
		let (_state, result) = self
			.all_calls_returned
			.wait_timeout_while(state, timeout, |state| state.unreturned_calls > 0)
			.unwrap();
		Ok(!result.timed_out())
	}

	fn check_transition_context(
		&self,
		state: &AccessState<D>,
		caller: &ControllerCore<D>,
		operation: &str,
	) -> Result<(), UsageError> {
		if !state.transition_in_progress || state.transition_thread != Some(std::thread::current().id()) {
			return Err(UsageError::new(format!(
				"{} is allowed only from a transition callback or subcall, controller: {}",
				operation,
				caller.describe_owner(),
			)));
		}
		Ok(())
	}

	fn check_caller_active(
		&self,
		state: &AccessState<D>,
		caller: &ControllerCore<D>,
		operation: &str,
	) -> Result<(), UsageError> {
		if state.active.as_ref().map(|slot| slot.id) != Some(caller.id()) {
			return Err(UsageError::new(format!(
				"the controller must be active to call {}, controller: {}",
				operation,
				caller.describe_owner(),
			)));
		}
		Ok(())
	}
}

/// The forwarded port operations.
///
/// Every operation runs inside an [`AccessCallGuard`]. Configuration calls
/// additionally take the config mutex; long running calls do not, so one
/// reader and one writer can be in flight at the same time.
impl<D: SerialDriver> Access<D> {
	pub(crate) fn open(&self, caller: &ControllerCore<D>) -> Result<(), AccessError> {
		let _call = AccessCallGuard::new(self, caller, "open")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.open()?)
	}

	pub(crate) fn ensure_open(&self, caller: &ControllerCore<D>) -> Result<(), AccessError> {
		let _call = AccessCallGuard::new(self, caller, "ensure_open")?;
		let _config = self.config_mutex.lock().unwrap();
		if !self.driver.is_open() {
			self.driver.open()?;
		}
		Ok(())
	}

	pub(crate) fn is_open(&self, caller: &ControllerCore<D>) -> Result<bool, AccessError> {
		let _call = AccessCallGuard::new(self, caller, "is_open")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.is_open())
	}

	pub(crate) fn close(&self, caller: &ControllerCore<D>) -> Result<(), AccessError> {
		let _call = AccessCallGuard::new(self, caller, "close")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.close()?)
	}

	pub(crate) fn available(&self, caller: &ControllerCore<D>) -> Result<usize, AccessError> {
		let _call = AccessCallGuard::new(self, caller, "available")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.available()?)
	}

	pub(crate) fn read(&self, caller: &ControllerCore<D>, buffer: &mut [u8]) -> Result<usize, AccessError> {
		let _call = AccessCallGuard::new(self, caller, "read")?;
		Ok(self.driver.read(buffer)?)
	}

	pub(crate) fn write(&self, caller: &ControllerCore<D>, data: &[u8]) -> Result<usize, AccessError> {
		let _call = AccessCallGuard::new(self, caller, "write")?;
		Ok(self.driver.write(data)?)
	}

	pub(crate) fn write_all(&self, caller: &ControllerCore<D>, data: &[u8]) -> Result<(), AccessError> {
		let _call = AccessCallGuard::new(self, caller, "write_all")?;
		Ok(self.driver.write_all(data)?)
	}

	pub(crate) fn flush(&self, caller: &ControllerCore<D>) -> Result<(), AccessError> {
		let _call = AccessCallGuard::new(self, caller, "flush")?;
		Ok(self.driver.flush()?)
	}

	pub(crate) fn discard_input_buffer(&self, caller: &ControllerCore<D>) -> Result<(), AccessError> {
		let _call = AccessCallGuard::new(self, caller, "discard_input_buffer")?;
		Ok(self.driver.discard_input_buffer()?)
	}

	pub(crate) fn discard_output_buffer(&self, caller: &ControllerCore<D>) -> Result<(), AccessError> {
		let _call = AccessCallGuard::new(self, caller, "discard_output_buffer")?;
		Ok(self.driver.discard_output_buffer()?)
	}

	pub(crate) fn baud_rate(&self, caller: &ControllerCore<D>) -> Result<u32, AccessError> {
		let _call = AccessCallGuard::new(self, caller, "baud_rate")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.baud_rate()?)
	}

	pub(crate) fn set_baud_rate(&self, caller: &ControllerCore<D>, baud_rate: u32) -> Result<(), AccessError> {
		let _call = AccessCallGuard::new(self, caller, "set_baud_rate")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.set_baud_rate(baud_rate)?)
	}

	pub(crate) fn char_size(&self, caller: &ControllerCore<D>) -> Result<crate::CharSize, AccessError> {
		let _call = AccessCallGuard::new(self, caller, "char_size")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.char_size()?)
	}

	pub(crate) fn set_char_size(&self, caller: &ControllerCore<D>, char_size: crate::CharSize) -> Result<(), AccessError> {
		let _call = AccessCallGuard::new(self, caller, "set_char_size")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.set_char_size(char_size)?)
	}

	pub(crate) fn parity(&self, caller: &ControllerCore<D>) -> Result<crate::Parity, AccessError> {
		let _call = AccessCallGuard::new(self, caller, "parity")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.parity()?)
	}

	pub(crate) fn set_parity(&self, caller: &ControllerCore<D>, parity: crate::Parity) -> Result<(), AccessError> {
		let _call = AccessCallGuard::new(self, caller, "set_parity")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.set_parity(parity)?)
	}

	pub(crate) fn stop_bits(&self, caller: &ControllerCore<D>) -> Result<crate::StopBits, AccessError> {
		let _call = AccessCallGuard::new(self, caller, "stop_bits")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.stop_bits()?)
	}

	pub(crate) fn set_stop_bits(&self, caller: &ControllerCore<D>, stop_bits: crate::StopBits) -> Result<(), AccessError> {
		let _call = AccessCallGuard::new(self, caller, "set_stop_bits")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.set_stop_bits(stop_bits)?)
	}

	pub(crate) fn flow_control(&self, caller: &ControllerCore<D>) -> Result<crate::FlowControl, AccessError> {
		let _call = AccessCallGuard::new(self, caller, "flow_control")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.flow_control()?)
	}

	pub(crate) fn set_flow_control(&self, caller: &ControllerCore<D>, flow_control: crate::FlowControl) -> Result<(), AccessError> {
		let _call = AccessCallGuard::new(self, caller, "set_flow_control")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.set_flow_control(flow_control)?)
	}

	pub(crate) fn read_timeout(&self, caller: &ControllerCore<D>) -> Result<Duration, AccessError> {
		let _call = AccessCallGuard::new(self, caller, "read_timeout")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.read_timeout()?)
	}

	pub(crate) fn set_read_timeout(&self, caller: &ControllerCore<D>, timeout: Duration) -> Result<(), AccessError> {
		let _call = AccessCallGuard::new(self, caller, "set_read_timeout")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.set_read_timeout(timeout)?)
	}

	pub(crate) fn write_timeout(&self, caller: &ControllerCore<D>) -> Result<Duration, AccessError> {
		let _call = AccessCallGuard::new(self, caller, "write_timeout")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.write_timeout()?)
	}

	pub(crate) fn set_write_timeout(&self, caller: &ControllerCore<D>, timeout: Duration) -> Result<(), AccessError> {
		let _call = AccessCallGuard::new(self, caller, "set_write_timeout")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.set_write_timeout(timeout)?)
	}

	pub(crate) fn apply_settings(&self, caller: &ControllerCore<D>, settings: &Settings) -> Result<(), AccessError> {
		let _call = AccessCallGuard::new(self, caller, "apply_settings")?;
		let _config = self.config_mutex.lock().unwrap();
		self.driver.set_baud_rate(settings.baud_rate)?;
		self.driver.set_char_size(settings.char_size)?;
		self.driver.set_parity(settings.parity)?;
		self.driver.set_stop_bits(settings.stop_bits)?;
		self.driver.set_flow_control(settings.flow_control)?;
		self.driver.set_read_timeout(settings.read_timeout)?;
		self.driver.set_write_timeout(settings.write_timeout)?;
		Ok(())
	}

	pub(crate) fn set_rts(&self, caller: &ControllerCore<D>, state: bool) -> Result<(), AccessError> {
		let _call = AccessCallGuard::new(self, caller, "set_rts")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.set_rts(state)?)
	}

	pub(crate) fn read_cts(&self, caller: &ControllerCore<D>) -> Result<bool, AccessError> {
		let _call = AccessCallGuard::new(self, caller, "read_cts")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.read_cts()?)
	}

	pub(crate) fn set_dtr(&self, caller: &ControllerCore<D>, state: bool) -> Result<(), AccessError> {
		let _call = AccessCallGuard::new(self, caller, "set_dtr")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.set_dtr(state)?)
	}

	pub(crate) fn read_dsr(&self, caller: &ControllerCore<D>) -> Result<bool, AccessError> {
		let _call = AccessCallGuard::new(self, caller, "read_dsr")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.read_dsr()?)
	}

	pub(crate) fn read_ri(&self, caller: &ControllerCore<D>) -> Result<bool, AccessError> {
		let _call = AccessCallGuard::new(self, caller, "read_ri")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.read_ri()?)
	}

	pub(crate) fn read_cd(&self, caller: &ControllerCore<D>) -> Result<bool, AccessError> {
		let _call = AccessCallGuard::new(self, caller, "read_cd")?;
		let _config = self.config_mutex.lock().unwrap();
		Ok(self.driver.read_cd()?)
	}
}

/// Queues and serializes transitions.
///
/// Acquiring a ticket blocks until every earlier ticket holder is done, so
/// at most one ticket exists at a time. Dropping it ends the transition and
/// lets the next queued one proceed.
struct TransitionTicket<'a, D: SerialDriver> {
	access: &'a Access<D>,
}

impl<'a, D: SerialDriver> TransitionTicket<'a, D> {
	fn acquire(access: &'a Access<D>) -> Self {
		let mut queue = access.queue.lock().unwrap();
		let ticket = queue.next_ticket;
		queue.next_ticket += 1;
		let queue = access
			.queue_ready
			.wait_while(queue, |queue| queue.ready_ticket != ticket)
			.unwrap();
		drop(queue);

		let mut state = access.state.lock().unwrap();
		state.transition_in_progress = true;
		state.transition_thread = Some(std::thread::current().id());
		drop(state);
		access.concurrent_swap_allowed.store(false, Ordering::SeqCst);

		Self { access }
	}
}

impl<D: SerialDriver> Drop for TransitionTicket<'_, D> {
	fn drop(&mut self) {
		let mut state = self.access.state.lock().unwrap();
		state.transition_in_progress = false;
		state.transition_thread = None;
		drop(state);
		self.access.access_unblocked.notify_all();

		let mut queue = self.access.queue.lock().unwrap();
		queue.ready_ticket += 1;
		drop(queue);
		self.access.queue_ready.notify_all();
	}
}

/// Makes sure access calls are unblocked once a transition ends.
///
/// Blocking is re-armed by `will_make_inactive` for each nested change, so
/// a concurrent active swap performed from a `will_remove` callback also
/// unblocks access when it finishes.
struct AccessUnblocker<'a, D: SerialDriver> {
	access: &'a Access<D>,
}

impl<'a, D: SerialDriver> AccessUnblocker<'a, D> {
	fn new(access: &'a Access<D>) -> Self {
		Self { access }
	}
}

impl<D: SerialDriver> Drop for AccessUnblocker<'_, D> {
	fn drop(&mut self) {
		let mut state = self.access.state.lock().unwrap();
		if !state.access_is_unblocked {
			state.access_is_unblocked = true;
			drop(state);
			self.access.access_unblocked.notify_all();
		}
	}
}

/// Scope of one access call.
///
/// Construction blocks while a transition has access blocked (never on the
/// transition thread itself), verifies the caller is the active controller,
/// and counts the call as outstanding. Dropping it uncounts the call and
/// signals the drain condition when it was the last one.
///
/// Concurrent access calls are allowed; serializing configuration calls is
/// the job of the config mutex.
struct AccessCallGuard<'a, D: SerialDriver> {
	access: &'a Access<D>,
}

impl<'a, D: SerialDriver> AccessCallGuard<'a, D> {
	fn new(access: &'a Access<D>, caller: &ControllerCore<D>, operation: &'static str) -> Result<Self, NotActive> {
		let caller_id = caller.id();
		let thread = std::thread::current().id();
		let state = access.state.lock().unwrap();
		let mut state = access
			.access_unblocked
			.wait_while(state, |state| {
				state.transition_in_progress
					&& state.transition_thread != Some(thread)
					&& !state.access_is_unblocked
			})
			.unwrap();
		if state.active.as_ref().map(|slot| slot.id) != Some(caller_id) {
			return Err(NotActive {
				controller: caller.describe_owner(),
				operation,
			});
		}
		state.unreturned_calls += 1;
		Ok(Self { access })
	}
}

impl<D: SerialDriver> Drop for AccessCallGuard<'_, D> {
	fn drop(&mut self) {
		let mut state = self.access.state.lock().unwrap();
		state.unreturned_calls -= 1;
		let drained = state.unreturned_calls == 0;
		drop(state);
		if drained {
			// All the condition signifies is that the count reached zero
			// at some point. Keeping it at zero requires call blocking.
			self.access.all_calls_returned.notify_all();
		}
	}
}
