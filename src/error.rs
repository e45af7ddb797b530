//! Typed errors for the store and notification components.
//!
//! These are surfaced to the CLI and HTTP layers, which translate them to
//! miette diagnostics or status codes respectively.

use thiserror::Error;

/// Rejections of config or API payloads. Always synchronous, never retried.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
	#[error("label set must not be empty")]
	EmptyLabelSet,

	#[error("invalid label name {0:?}")]
	InvalidLabelName(String),

	#[error("matcher on {name:?}: invalid regular expression: {source}")]
	InvalidRegex {
		name: String,
		source: regex::Error,
	},

	#[error("silence must have at least one matcher")]
	NoMatchers,

	#[error("silence start must be before end")]
	TimeOrder,

	#[error("route {0:?} references unknown receiver")]
	UnknownReceiver(String),

	#[error("duplicate receiver name {0:?}")]
	DuplicateReceiver(String),

	#[error("inhibit rule equal label {0:?} is not a valid label name")]
	InvalidEqualLabel(String),
}

/// Failures from the alert, silence, and nflog stores.
#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
	#[error("not found")]
	NotFound,

	#[error(transparent)]
	Invalid(#[from] ValidationError),

	#[error("subscriber lagged and was dropped")]
	SubscriberLagged,

	#[error("decoding replicated state: {0}")]
	Decode(String),
}

/// Failure classification recorded on notification metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
	Other,
	ClientError,
	ServerError,
	ContextCanceled,
	ContextDeadlineExceeded,
}

impl FailureReason {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Other => "other",
			Self::ClientError => "clientError",
			Self::ServerError => "serverError",
			Self::ContextCanceled => "contextCanceled",
			Self::ContextDeadlineExceeded => "contextDeadlineExceeded",
		}
	}

	pub fn from_status(status: reqwest::StatusCode) -> Self {
		if status.is_client_error() {
			Self::ClientError
		} else if status.is_server_error() {
			Self::ServerError
		} else {
			Self::Other
		}
	}
}

/// A failed notification attempt.
///
/// `retry` distinguishes transient failures (server errors, timeouts) from
/// permanent ones (client errors); the retry stage only loops on the former.
#[derive(Debug, Error)]
#[error("{message} ({})", .reason.as_str())]
pub struct NotifyError {
	pub reason: FailureReason,
	pub retry: bool,
	pub message: String,
}

impl NotifyError {
	pub fn transient(reason: FailureReason, message: impl Into<String>) -> Self {
		Self {
			reason,
			retry: true,
			message: message.into(),
		}
	}

	pub fn permanent(reason: FailureReason, message: impl Into<String>) -> Self {
		Self {
			reason,
			retry: false,
			message: message.into(),
		}
	}

	pub fn deadline() -> Self {
		Self {
			reason: FailureReason::ContextDeadlineExceeded,
			retry: false,
			message: "notification deadline exceeded".into(),
		}
	}

	pub fn canceled() -> Self {
		Self {
			reason: FailureReason::ContextCanceled,
			retry: false,
			message: "notification canceled".into(),
		}
	}
}

impl From<reqwest::Error> for NotifyError {
	fn from(err: reqwest::Error) -> Self {
		if err.is_timeout() {
			return Self::transient(FailureReason::ContextDeadlineExceeded, err.to_string());
		}
		match err.status() {
			Some(status) if status.is_server_error() => {
				Self::transient(FailureReason::ServerError, err.to_string())
			}
			Some(status) if status.is_client_error() => {
				Self::permanent(FailureReason::ClientError, err.to_string())
			}
			_ => Self::transient(FailureReason::Other, err.to_string()),
		}
	}
}

/// Failures in the gossip mesh. Best-effort: these are logged and counted,
/// never fatal to the daemon once bootstrapped.
#[derive(Debug, Error)]
pub enum ClusterError {
	#[error("binding cluster listener: {0}")]
	Bind(std::io::Error),

	#[error("peer io: {0}")]
	Io(#[from] std::io::Error),

	#[error("decoding peer message: {0}")]
	Decode(#[from] bincode::Error),

	#[error("unknown state channel {0:?}")]
	UnknownChannel(String),
}
