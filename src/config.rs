//! Mirror configuration: upstream endpoints, auth payload, paging, and persistence target.

// std
use std::{env, path::PathBuf};
// crates.io
use serde_json::Value;
use url::Url;
// self
use crate::_prelude::*;

/// Default upstream gateway.
pub const DEFAULT_BASE_URL: &str = "https://gateway.qg1.apps.qualys.com";
/// Default path of the certificate list endpoint.
pub const DEFAULT_LIST_ENDPOINT: &str = "/certview/v2/certificates/list";
/// Default path of the token endpoint, joined onto the base URL.
pub const DEFAULT_AUTH_ENDPOINT: &str = "/auth/token";
/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default number of records requested per page.
pub const DEFAULT_PAGE_SIZE: u32 = 50;
/// Default SQLite database location.
pub const DEFAULT_DATABASE_PATH: &str = "certificates.db";

/// Configuration for a mirror instance.
#[derive(Clone, Debug)]
pub struct MirrorConfig {
	/// Prefix for upstream URLs.
	pub base_url: Url,
	/// Path of the list endpoint, appended to `base_url`.
	pub list_endpoint: String,
	/// Full URL of the token endpoint.
	pub auth_url: Url,
	/// JSON body sent to the token endpoint.
	pub auth_payload: Value,
	/// Per-request timeout applied to upstream calls.
	pub timeout: Duration,
	/// Records requested per page.
	pub page_size: u32,
	/// SQLite database location.
	pub database_path: PathBuf,
}
impl MirrorConfig {
	/// Construct a configuration with default endpoints and limits.
	pub fn new(base_url: impl AsRef<str>) -> Result<Self> {
		let base_url = Url::parse(base_url.as_ref())?;
		let auth_url = join_url(&base_url, DEFAULT_AUTH_ENDPOINT)?;

		Ok(Self {
			base_url,
			list_endpoint: DEFAULT_LIST_ENDPOINT.into(),
			auth_url,
			auth_payload: Value::Object(Default::default()),
			timeout: DEFAULT_TIMEOUT,
			page_size: DEFAULT_PAGE_SIZE,
			database_path: DEFAULT_DATABASE_PATH.into(),
		})
	}

	/// Load configuration from the process environment.
	///
	/// Reads `BASE_URL`, `LIST_ENDPOINT`, `AUTH_URL`, `AUTH_PAYLOAD`, `TIMEOUT_SECS`,
	/// `PAGE_SIZE`, and `DATABASE_URL`; unset variables keep their defaults.
	pub fn from_env() -> Result<Self> {
		let mut config =
			Self::new(env::var("BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into()))?;

		if let Ok(endpoint) = env::var("LIST_ENDPOINT") {
			config.list_endpoint = endpoint;
		}
		if let Ok(auth_url) = env::var("AUTH_URL") {
			config.auth_url = Url::parse(&auth_url)?;
		}
		if let Ok(payload) = env::var("AUTH_PAYLOAD") {
			config = config.with_auth_payload_str(&payload)?;
		}
		if let Ok(raw) = env::var("TIMEOUT_SECS") {
			let secs = raw.parse::<u64>().map_err(|err| Error::Validation {
				field: "TIMEOUT_SECS",
				reason: format!("Must be a whole number of seconds: {err}."),
			})?;

			config.timeout = Duration::from_secs(secs);
		}
		if let Ok(raw) = env::var("PAGE_SIZE") {
			config.page_size = raw.parse::<u32>().map_err(|err| Error::Validation {
				field: "PAGE_SIZE",
				reason: format!("Must be a positive integer: {err}."),
			})?;
		}
		if let Ok(database_url) = env::var("DATABASE_URL") {
			config.database_path = database_path_from(&database_url);
		}

		Ok(config)
	}

	/// Replace the token endpoint URL.
	pub fn with_auth_url(mut self, auth_url: Url) -> Self {
		self.auth_url = auth_url;

		self
	}

	/// Replace the auth payload with a JSON value.
	pub fn with_auth_payload(mut self, payload: Value) -> Self {
		self.auth_payload = payload;

		self
	}

	/// Replace the auth payload with a pre-serialized JSON string.
	pub fn with_auth_payload_str(mut self, raw: &str) -> Result<Self> {
		self.auth_payload = serde_json::from_str(raw).map_err(|err| Error::Validation {
			field: "auth_payload",
			reason: format!("Must be valid JSON: {err}."),
		})?;

		Ok(self)
	}

	/// Replace the list endpoint path.
	pub fn with_list_endpoint(mut self, endpoint: impl Into<String>) -> Self {
		self.list_endpoint = endpoint.into();

		self
	}

	/// Replace the per-request timeout.
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;

		self
	}

	/// Replace the page size.
	pub fn with_page_size(mut self, page_size: u32) -> Self {
		self.page_size = page_size;

		self
	}

	/// Replace the database location.
	pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.database_path = path.into();

		self
	}

	/// Validate the configuration against the documented constraints.
	pub fn validate(&self) -> Result<()> {
		if self.page_size == 0 {
			return Err(Error::Validation {
				field: "page_size",
				reason: "Must be greater than zero.".into(),
			});
		}
		if self.timeout < Duration::from_secs(1) {
			return Err(Error::Validation {
				field: "timeout",
				reason: "Must be at least 1 second.".into(),
			});
		}
		if !self.list_endpoint.starts_with('/') {
			return Err(Error::Validation {
				field: "list_endpoint",
				reason: "Must be an absolute path starting with '/'.".into(),
			});
		}
		if !self.auth_payload.is_object() {
			return Err(Error::Validation {
				field: "auth_payload",
				reason: "Must be a JSON object.".into(),
			});
		}

		Ok(())
	}

	/// Full URL of the list endpoint.
	pub fn list_url(&self) -> Result<Url> {
		join_url(&self.base_url, &self.list_endpoint)
	}
}

fn join_url(base: &Url, path: &str) -> Result<Url> {
	Ok(Url::parse(&format!("{}{path}", base.as_str().trim_end_matches('/')))?)
}

fn database_path_from(raw: &str) -> PathBuf {
	// Tolerate SQLAlchemy-style URLs alongside plain paths.
	raw.strip_prefix("sqlite:///").or_else(|| raw.strip_prefix("sqlite://")).unwrap_or(raw).into()
}

#[cfg(test)]
mod tests {
	// crates.io
	use serde_json::json;
	// self
	use super::*;

	#[test]
	fn defaults_fill_endpoints_and_limits() {
		let config = MirrorConfig::new("https://gateway.example.com").expect("config");

		assert_eq!(config.list_endpoint, DEFAULT_LIST_ENDPOINT);
		assert_eq!(config.auth_url.as_str(), "https://gateway.example.com/auth/token");
		assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
		assert_eq!(config.timeout, DEFAULT_TIMEOUT);
		assert!(config.validate().is_ok());
	}

	#[test]
	fn list_url_joins_base_and_endpoint() {
		let config = MirrorConfig::new("https://gateway.example.com/").expect("config");

		assert_eq!(
			config.list_url().expect("list url").as_str(),
			"https://gateway.example.com/certview/v2/certificates/list",
		);
	}

	#[test]
	fn auth_payload_accepts_object_and_serialized_string() {
		let config = MirrorConfig::new("https://gateway.example.com")
			.expect("config")
			.with_auth_payload(json!({ "username": "u", "password": "p" }));

		assert!(config.validate().is_ok());

		let config = config.with_auth_payload_str(r#"{"username":"u2"}"#).expect("payload");

		assert_eq!(config.auth_payload["username"], "u2");
		assert!(
			MirrorConfig::new("https://gateway.example.com")
				.expect("config")
				.with_auth_payload_str("not json")
				.is_err()
		);
	}

	#[test]
	fn rejects_zero_page_size_and_relative_endpoint() {
		let config = MirrorConfig::new("https://gateway.example.com").expect("config");

		assert!(config.clone().with_page_size(0).validate().is_err());
		assert!(config.with_list_endpoint("relative/path").validate().is_err());
	}

	#[test]
	fn database_url_tolerates_sqlite_prefixes() {
		assert_eq!(database_path_from("sqlite:///app.db"), PathBuf::from("app.db"));
		assert_eq!(database_path_from("certificates.db"), PathBuf::from("certificates.db"));
		assert_eq!(database_path_from("sqlite:////var/lib/app.db"), PathBuf::from("/var/lib/app.db"));
	}
}
