use assert2::{assert, let_assert};
use test_log::test;

use portshare::{AccessError, Controller, TransitionError};

mod common;

use common::{as_strs, Rig};

#[test]
fn test_first_activation_builds_the_access_list() {
	let rig = Rig::new();
	let c1 = rig.controller("C1");
	let c2 = rig.controller("C2");
	c1.core().register_delegate(c2.as_controller()).unwrap();

	assert!(let Ok(()) = c1.make_active());
	assert!(c1.is_active());
	assert!(!c2.is_active());

	let events = rig.take_events();
	assert!(as_strs(&events) == vec!["C1.will_make_active", "C2.did_add", "C1.did_add", "C1.did_make_active"]);
}

#[test]
fn test_active_swap_within_one_access_list() {
	let rig = Rig::new();
	let c1 = rig.controller("C1");
	let c2 = rig.controller("C2");
	c1.core().register_delegate(c2.as_controller()).unwrap();
	c1.make_active().unwrap();
	rig.take_events();

	// C2 is already in the access list, so this only swaps the active
	// controller: no will_remove or did_add fires.
	assert!(let Ok(()) = c2.core().make_active());
	assert!(c2.is_active());
	assert!(!c1.is_active());
	assert!(c1.core().is_current());

	let events = rig.take_events();
	assert!(
		as_strs(&events)
			== vec![
				"C1.will_make_inactive",
				"C2.will_make_active",
				"C1.did_make_inactive",
				"C2.did_make_active",
			]
	);
}

#[test]
fn test_current_change_replaces_the_access_list() {
	let rig = Rig::new();
	let c1 = rig.controller("C1");
	let c3 = rig.controller("C3");
	c1.make_active().unwrap();
	rig.take_events();

	// C3 is not in C1's access list, so making it active replaces the
	// current controller.
	assert!(let Ok(()) = c3.make_active());
	assert!(c3.is_active());
	assert!(c3.core().is_current());
	assert!(!c1.is_active());

	let events = rig.take_events();
	assert!(
		as_strs(&events)
			== vec![
				"C1.will_remove",
				"C1.will_make_inactive",
				"C3.will_make_active",
				"C1.did_make_inactive",
				"C1.did_remove",
				"C3.did_add",
				"C3.did_make_active",
			]
	);
}

#[test]
fn test_make_active_is_idempotent() {
	let rig = Rig::new();
	let c1 = rig.controller("C1");
	c1.make_active().unwrap();
	rig.take_events();

	assert!(let Ok(()) = c1.make_active());
	assert!(rig.take_events().is_empty());
	assert!(c1.is_active());
}

#[test]
fn test_make_inactive_when_not_active_is_a_noop() {
	let rig = Rig::new();
	let c1 = rig.controller("C1");
	let c2 = rig.controller("C2");
	c1.make_active().unwrap();
	rig.take_events();

	assert!(let Ok(()) = c2.make_inactive());
	assert!(rig.take_events().is_empty());
	assert!(c1.is_active());
}

#[test]
fn test_make_inactive_leaves_the_access_list_in_place() {
	let rig = Rig::new();
	let c1 = rig.controller("C1");
	c1.make_active().unwrap();
	rig.take_events();

	assert!(let Ok(()) = c1.make_inactive());
	assert!(!c1.is_active());
	assert!(c1.core().is_current());

	let events = rig.take_events();
	assert!(as_strs(&events) == vec!["C1.will_make_inactive", "C1.did_make_inactive"]);
}

#[test]
fn test_refusal_to_go_inactive_cancels_the_current_change() {
	let rig = Rig::new();
	let c1 = rig.controller("C1");
	let c2 = rig.controller("C2");
	c1.make_active().unwrap();
	c1.set_refuse_inactive(true);
	rig.take_events();

	let_assert!(Err(TransitionError::Refused(refused)) = c2.make_active());
	assert!(refused.reason == "the test says no");

	// Nothing changed.
	assert!(c1.is_active());
	assert!(c1.core().is_current());
	assert!(!c2.is_active());

	let events = rig.take_events();
	assert!(as_strs(&events) == vec!["C1.will_remove", "C1.will_make_inactive", "C1.did_cancel_remove"]);
}

#[test]
fn test_refusal_to_be_removed_cancels_the_current_change() {
	let rig = Rig::new();
	let c1 = rig.controller("C1");
	let c2 = rig.controller("C2");
	c1.make_active().unwrap();
	c1.set_refuse_remove(true);
	rig.take_events();

	let_assert!(Err(TransitionError::Refused(_)) = c2.make_active());
	assert!(c1.is_active());

	let events = rig.take_events();
	assert!(as_strs(&events) == vec!["C1.will_remove", "C1.did_cancel_remove"]);
}

#[test]
fn test_cancelled_removal_notifies_in_reverse_order() {
	let rig = Rig::new();
	let root = rig.controller("R");
	let a = rig.controller("A");
	let b = rig.controller("B");
	let n = rig.controller("N");
	root.core().register_delegate(a.as_controller()).unwrap();
	root.core().register_delegate(b.as_controller()).unwrap();
	root.make_active().unwrap();
	b.set_refuse_remove(true);
	rig.take_events();

	let_assert!(Err(TransitionError::Refused(_)) = n.make_active());

	// B refused, so only R and A were notified; they hear the
	// cancellation in reverse notification order.
	let events = rig.take_events();
	assert!(
		as_strs(&events)
			== vec![
				"R.will_remove",
				"A.will_remove",
				"B.will_remove",
				"A.did_cancel_remove",
				"R.did_cancel_remove",
			]
	);
}

#[test]
fn test_remove_from_access() {
	let rig = Rig::new();
	let c1 = rig.controller("C1");
	c1.make_active().unwrap();
	rig.take_events();

	assert!(let Ok(()) = c1.remove_from_access());
	assert!(!c1.is_active());
	assert!(!c1.core().is_current());
	assert!(rig.port.current_controller().is_none());

	let events = rig.take_events();
	assert!(
		as_strs(&events)
			== vec![
				"C1.will_remove",
				"C1.will_make_inactive",
				"C1.did_make_inactive",
				"C1.did_remove",
			]
	);
}

#[test]
fn test_remove_when_not_listed_is_a_noop() {
	let rig = Rig::new();
	let c1 = rig.controller("C1");
	let c2 = rig.controller("C2");
	c1.make_active().unwrap();
	rig.take_events();

	assert!(let Ok(()) = c2.remove_from_access());
	assert!(rig.take_events().is_empty());
	assert!(c1.is_active());
}

#[test]
fn test_removing_a_delegate_directly_is_an_error() {
	let rig = Rig::new();
	let root = rig.controller("R");
	let delegate = rig.controller("D");
	root.core().register_delegate(delegate.as_controller()).unwrap();
	root.make_active().unwrap();

	let_assert!(Err(TransitionError::Usage(_)) = delegate.remove_from_access());
	assert!(root.is_active());
}

#[test]
fn test_did_add_runs_leaf_first() {
	let rig = Rig::new();
	let root = rig.controller("R");
	let a = rig.controller("A");
	let b = rig.controller("B");
	let a1 = rig.controller("A1");
	a.core().register_delegate(a1.as_controller()).unwrap();
	root.core().register_delegate(a.as_controller()).unwrap();
	root.core().register_delegate(b.as_controller()).unwrap();

	root.make_active().unwrap();

	// The access list is breadth first (R, A, B, A1); did_add walks it in
	// reverse so the deepest delegates hear it first and the new current
	// controller last.
	let events = rig.take_events();
	assert!(
		as_strs(&events)
			== vec![
				"R.will_make_active",
				"A1.did_add",
				"B.did_add",
				"A.did_add",
				"R.did_add",
				"R.did_make_active",
			]
	);
}

#[test]
fn test_current_controller_is_visible_on_the_port() {
	let rig = Rig::new();
	let c1 = rig.controller("C1");
	assert!(rig.port.current_controller().is_none());

	c1.make_active().unwrap();
	let_assert!(Some(current) = rig.port.current_controller());
	assert!(std::sync::Arc::ptr_eq(&current, &c1.as_controller()));
}

#[test]
fn test_transition_utilities_outside_a_transition_are_an_error() {
	let rig = Rig::new();
	let c1 = rig.controller("C1");
	c1.make_active().unwrap();

	assert!(c1.core().block_access_calls().is_err());
	assert!(c1.core().unblock_access_calls().is_err());
	assert!(c1.core().wait_for_access_calls_to_return(std::time::Duration::from_millis(10)).is_err());
}

#[test]
fn test_access_calls_require_the_active_role() {
	let rig = Rig::new();
	let c1 = rig.controller("C1");
	let c2 = rig.controller("C2");
	c1.make_active().unwrap();

	let_assert!(Err(AccessError::NotActive(not_active)) = c2.core().write(b"nope"));
	assert!(not_active.operation == "write");

	c1.core().open().unwrap();
	c1.core().write_all(b"hello").unwrap();
	assert!(rig.mock.take_tx() == b"hello");
}

#[test]
fn test_active_swap_from_a_will_remove_callback() {
	let rig = Rig::new();
	let root = rig.controller("R");
	let a = rig.controller("A");
	let n = rig.controller("N");
	root.core().register_delegate(a.as_controller()).unwrap();
	root.make_active().unwrap();
	a.core().make_active().unwrap();
	assert!(a.is_active());

	// While being asked to leave, the delegating controller takes the
	// active role away from its delegate. The swap runs on the transition
	// thread, concurrent with the current controller change.
	let delegate = a.as_controller();
	root.set_will_remove_hook(move || {
		delegate.core().make_inactive().unwrap();
	});
	rig.take_events();

	assert!(let Ok(()) = n.make_active());
	assert!(n.is_active());

	let events = rig.take_events();
	assert!(
		as_strs(&events)
			== vec![
				"R.will_remove",
				"A.will_make_inactive",
				"A.did_make_inactive",
				"A.will_remove",
				"N.will_make_active",
				"R.did_remove",
				"A.did_remove",
				"N.did_add",
				"N.did_make_active",
			]
	);
}

#[test]
fn test_concurrent_swaps_stay_serialized() {
	let rig = Rig::new();
	let root = rig.controller("R");
	let x = rig.controller("X");
	let y = rig.controller("Y");
	root.core().register_delegate(x.as_controller()).unwrap();
	root.core().register_delegate(y.as_controller()).unwrap();
	root.make_active().unwrap();
	rig.take_events();

	std::thread::scope(|scope| {
		scope.spawn(|| {
			for _ in 0..50 {
				x.core().make_active().unwrap();
			}
		});
		scope.spawn(|| {
			for _ in 0..50 {
				y.core().make_active().unwrap();
			}
		});
	});

	// Transitions are serialized, so each controller alternates between
	// gaining and losing the active role.
	let events = rig.take_events();
	for name in ["X", "Y"] {
		let gained = format!("{}.did_make_active", name);
		let lost = format!("{}.did_make_inactive", name);
		let mut active = false;
		for event in events.iter().filter(|e| **e == gained || **e == lost) {
			if *event == gained {
				assert!(!active, "{} became active twice in a row", name);
				active = true;
			} else {
				assert!(active, "{} became inactive twice in a row", name);
				active = false;
			}
		}
	}
}
