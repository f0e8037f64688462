use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use portshare::{Controller, ControllerCore, Port, Refused, TransitionError};

use super::mock_driver::MockDriver;

/// Shared log of callback invocations, as `"<name>.<callback>"` strings.
pub type Events = Arc<Mutex<Vec<String>>>;

pub fn as_strs(events: &[String]) -> Vec<&str> {
	events.iter().map(String::as_str).collect()
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// A controller that records its callbacks and can be told to refuse.
pub struct TestController {
	inner: Arc<TestInner>,
}

pub struct TestInner {
	core: ControllerCore<MockDriver>,
	name: &'static str,
	events: Events,
	refuse_remove: AtomicBool,
	refuse_inactive: AtomicBool,
	drain_timeout: Mutex<Duration>,
	will_remove_hook: Mutex<Option<Hook>>,
}

impl TestController {
	pub fn new(port: &Port<MockDriver>, name: &'static str, events: &Events) -> Self {
		let port = port.clone();
		let events = events.clone();
		let inner = Arc::new_cyclic(|weak: &Weak<TestInner>| TestInner {
			core: ControllerCore::new(port, weak.clone()),
			name,
			events,
			refuse_remove: AtomicBool::new(false),
			refuse_inactive: AtomicBool::new(false),
			drain_timeout: Mutex::new(Duration::from_millis(1500)),
			will_remove_hook: Mutex::new(None),
		});
		Self { inner }
	}

	pub fn core(&self) -> &ControllerCore<MockDriver> {
		&self.inner.core
	}

	pub fn as_controller(&self) -> Arc<dyn Controller<MockDriver>> {
		self.inner.clone()
	}

	pub fn make_active(&self) -> Result<(), TransitionError> {
		self.inner.core.make_active()
	}

	pub fn make_inactive(&self) -> Result<(), TransitionError> {
		self.inner.core.make_inactive()
	}

	pub fn remove_from_access(&self) -> Result<(), TransitionError> {
		self.inner.core.remove_from_access()
	}

	pub fn is_active(&self) -> bool {
		self.inner.core.is_active()
	}

	pub fn set_refuse_remove(&self, refuse: bool) {
		self.inner.refuse_remove.store(refuse, Relaxed);
	}

	pub fn set_refuse_inactive(&self, refuse: bool) {
		self.inner.refuse_inactive.store(refuse, Relaxed);
	}

	pub fn set_drain_timeout(&self, timeout: Duration) {
		*self.inner.drain_timeout.lock().unwrap() = timeout;
	}

	/// Run `hook` from inside the controller's `will_remove` callback.
	pub fn set_will_remove_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
		*self.inner.will_remove_hook.lock().unwrap() = Some(Box::new(hook));
	}
}

impl Drop for TestController {
	fn drop(&mut self) {
		// Leave the access cleanly no matter what the test configured.
		self.set_refuse_remove(false);
		self.set_refuse_inactive(false);
		let _ = self.inner.core.remove_if_current();
	}
}

impl TestInner {
	fn record(&self, callback: &str) {
		self.events.lock().unwrap().push(format!("{}.{}", self.name, callback));
	}
}

impl Controller<MockDriver> for TestInner {
	fn core(&self) -> &ControllerCore<MockDriver> {
		&self.core
	}

	fn kind(&self) -> &'static str {
		"TestController"
	}

	fn drain_timeout(&self) -> Duration {
		*self.drain_timeout.lock().unwrap()
	}

	fn will_remove(&self) -> Result<(), TransitionError> {
		self.record("will_remove");
		if let Some(hook) = self.will_remove_hook.lock().unwrap().as_ref() {
			hook();
		}
		if self.refuse_remove.load(Relaxed) {
			return Err(Refused::new(self.describe(), "the test says no").into());
		}
		Ok(())
	}

	fn did_cancel_remove(&self) {
		self.record("did_cancel_remove");
	}

	fn did_remove(&self) {
		self.record("did_remove");
	}

	fn did_add(&self) {
		self.record("did_add");
	}

	fn will_make_inactive(&self) -> Result<(), TransitionError> {
		self.record("will_make_inactive");
		if self.refuse_inactive.load(Relaxed) {
			return Err(Refused::new(self.describe(), "the test says no").into());
		}
		self.core.block_access_calls()?;
		if !self.core.wait_for_access_calls_to_return(self.drain_timeout())? {
			return Err(Refused::new(self.describe(), "access calls have not returned").into());
		}
		Ok(())
	}

	fn did_cancel_make_inactive(&self) {
		self.record("did_cancel_make_inactive");
	}

	fn did_make_inactive(&self) {
		self.record("did_make_inactive");
	}

	fn will_make_active(&self) {
		self.record("will_make_active");
	}

	fn did_make_active(&self) -> Result<(), TransitionError> {
		self.record("did_make_active");
		Ok(())
	}
}
