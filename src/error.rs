//! Crate-wide error types and `Result` alias.

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the certificate mirror crate.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	ChronoParse(#[from] chrono::ParseError),
	#[error(transparent)]
	Csv(#[from] csv::Error),
	#[error(transparent)]
	Serde(#[from] serde_json::Error),
	#[error(transparent)]
	Sqlite(#[from] rusqlite::Error),
	#[error(transparent)]
	Transport(#[from] reqwest::Error),
	#[error(transparent)]
	Url(#[from] url::ParseError),

	#[error("Auth endpoint failure: {reason}")]
	Auth { status: Option<reqwest::StatusCode>, reason: String },
	#[error("Operation rejected: {0}")]
	Concurrency(String),
	#[error("Invalid input: {0}")]
	Input(String),
	#[error("Upstream HTTP status {status} from {url}: {body:?}")]
	Upstream { status: reqwest::StatusCode, url: url::Url, body: Option<String> },
	#[error("Validation failed for {field}: {reason}")]
	Validation { field: &'static str, reason: String },
}
impl Error {
	/// Whether this error is an upstream authentication rejection (401/403).
	pub fn is_auth_rejection(&self) -> bool {
		matches!(
			self,
			Error::Upstream { status, .. }
				if *status == reqwest::StatusCode::UNAUTHORIZED
					|| *status == reqwest::StatusCode::FORBIDDEN
		)
	}
}
