/// An error that can occur when managing which controller is active.
#[derive(Debug)]
pub enum TransitionError {
	/// A controller declined the requested change.
	Refused(Refused),

	/// The request violated the API contract.
	Usage(UsageError),

	/// A port operation performed during the change failed.
	Access(AccessError),
}

/// An error that can occur during a forwarded port operation.
#[derive(Debug)]
pub enum AccessError {
	/// The calling controller is not the active controller.
	NotActive(NotActive),

	/// The underlying serial driver reported an error.
	Io(std::io::Error),
}

/// A port operation was issued by a controller that is not active.
///
/// Raised before the driver is touched.
#[derive(Debug, Clone)]
pub struct NotActive {
	/// Description of the controller that made the call.
	pub controller: String,

	/// The operation that was attempted.
	pub operation: &'static str,
}

/// A controller declined to be made inactive or removed from the access list.
///
/// Returned from a controller's `will_make_inactive` or `will_remove`
/// callback to cancel the change. The state of the access is unchanged.
#[derive(Debug, Clone)]
pub struct Refused {
	/// Description of the refusing controller.
	pub controller: String,

	/// Why the controller refused.
	pub reason: String,
}

/// The caller (or a controller implementation) violated the API contract.
#[derive(Debug, Clone)]
pub struct UsageError {
	pub message: String,
}

impl Refused {
	/// Create a refusal.
	///
	/// `controller` should describe the refusing controller, typically
	/// [`Controller::describe`][crate::Controller::describe].
	pub fn new(controller: impl Into<String>, reason: impl Into<String>) -> Self {
		Self {
			controller: controller.into(),
			reason: reason.into(),
		}
	}
}

impl UsageError {
	pub(crate) fn new(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
		}
	}
}

impl std::error::Error for TransitionError {}
impl std::error::Error for AccessError {}
impl std::error::Error for NotActive {}
impl std::error::Error for Refused {}
impl std::error::Error for UsageError {}

impl From<Refused> for TransitionError {
	fn from(other: Refused) -> Self {
		Self::Refused(other)
	}
}

impl From<UsageError> for TransitionError {
	fn from(other: UsageError) -> Self {
		Self::Usage(other)
	}
}

impl From<AccessError> for TransitionError {
	fn from(other: AccessError) -> Self {
		Self::Access(other)
	}
}

impl From<NotActive> for TransitionError {
	fn from(other: NotActive) -> Self {
		Self::Access(AccessError::NotActive(other))
	}
}

impl From<NotActive> for AccessError {
	fn from(other: NotActive) -> Self {
		Self::NotActive(other)
	}
}

impl From<std::io::Error> for AccessError {
	fn from(other: std::io::Error) -> Self {
		Self::Io(other)
	}
}

impl From<std::io::ErrorKind> for AccessError {
	fn from(other: std::io::ErrorKind) -> Self {
		Self::Io(other.into())
	}
}

impl std::fmt::Display for TransitionError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Self::Refused(e) => write!(f, "{}", e),
			Self::Usage(e) => write!(f, "{}", e),
			Self::Access(e) => write!(f, "{}", e),
		}
	}
}

impl std::fmt::Display for AccessError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Self::NotActive(e) => write!(f, "{}", e),
			Self::Io(e) => write!(f, "{}", e),
		}
	}
}

impl std::fmt::Display for NotActive {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(
			f,
			"the controller must be active to call {}, inactive controller: {}",
			self.operation, self.controller
		)
	}
}

impl std::fmt::Display for Refused {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "refused by {}: {}", self.controller, self.reason)
	}
}

impl std::fmt::Display for UsageError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{}", self.message)
	}
}

impl TransitionError {
	/// Check if the error is a refusal.
	pub fn is_refused(&self) -> bool {
		matches!(self, Self::Refused(_))
	}
}
