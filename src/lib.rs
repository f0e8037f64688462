//! Arbitrate exclusive use of a serial port between cooperating
//! controllers.
//!
//! A serial port can serve only one protocol dialogue at a time, but a
//! program often has several components that want to drive it: a
//! bootloader flasher, a console logger, a handshake probe. This crate
//! multiplexes the port between such *controllers* inside one process. At
//! any moment at most one controller is *active* and allowed to use the
//! port; the others wait, ask for the role, or get refused.
//!
//! Hand-offs are cooperative. Before a controller loses the active role
//! its in-flight port operations are drained (new calls block, outstanding
//! ones are awaited), and the controller gets a chance to refuse the
//! change, for example because it is locked or still mid-transfer.
//! Transitions are serialized in FIFO order, and a controller composed of
//! sub-controllers can share its place with them through delegation.
//!
//! The entry points:
//!
//! - [`PortRegistry`] hands out [`Port`] handles and guarantees a single
//!   device object per device name.
//! - [`LockableController`] is a ready-made controller that can pin itself
//!   against preemption with
//!   [`make_locked_active()`][LockableController::make_locked_active].
//! - Custom controllers implement [`Controller`] and embed a
//!   [`ControllerCore`]; the trait's callbacks observe and veto
//!   transitions.
//! - The port backend is pluggable through [`SerialDriver`]; the default
//!   backend (cargo feature `serial2`, enabled by default) drives real
//!   ports with the [`serial2`] crate.
//!
//! ```no_run
//! use portshare::LockableController;
//!
//! let controller = LockableController::for_device("/dev/ttyUSB0")?;
//! controller.make_locked_active()?;
//! controller.open()?;
//! controller.set_baud_rate(115200)?;
//! controller.write_all(b"AT\r\n")?;
//! controller.make_inactive()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! With the `log` feature enabled the crate logs transitions with the
//! [`log`] crate.

#[macro_use]
mod log;

mod access;
mod controller;
mod device;
mod driver;
mod error;
mod lockable;
mod registry;

pub use controller::{Controller, ControllerCore, ControllerId, DEFAULT_DRAIN_TIMEOUT};
pub use device::Port;
pub use driver::{CharSize, DeviceInfo, FlowControl, Parity, SerialDriver, Settings, StopBits};
pub use error::{AccessError, NotActive, Refused, TransitionError, UsageError};
pub use lockable::LockableController;
pub use registry::PortRegistry;

#[cfg(feature = "serial2")]
pub use driver::serial2::SerialPortDriver;
