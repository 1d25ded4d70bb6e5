//! Bearer-credential lifecycle: thread-safe cache with TTL and forced refresh.

// crates.io
use reqwest::Client;
use serde_json::Value;
use tokio::sync::Mutex;
use url::Url;
// self
use crate::{
	_prelude::*,
	config::MirrorConfig,
	http::retry::{RetryExecutor, RetryPolicy, is_transient_status},
	store::{Store, TokenRecord},
};

/// Token lifetime advertised by the upstream auth endpoint.
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(4 * 60 * 60);
/// Age at which a cached token is replaced.
///
/// The 30-minute margin below [`TOKEN_LIFETIME`] keeps in-flight requests from being
/// invalidated mid-use.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(12_600);

#[derive(Clone, Debug)]
struct CachedToken {
	value: String,
	issued_at: Instant,
}
impl CachedToken {
	fn is_fresh(&self, now: Instant) -> bool {
		now.saturating_duration_since(self.issued_at) < REFRESH_INTERVAL
	}
}

/// Produces a valid credential on demand, amortizing re-authentication.
///
/// The internal mutex brackets the entire refresh, so at most one fetch is in flight
/// and concurrent callers awaiting a refresh all observe the same newly issued token.
#[derive(Debug)]
pub struct TokenCache {
	auth_url: Url,
	payload: Value,
	http: Client,
	retry: RetryPolicy,
	timeout: Duration,
	slot: Mutex<Option<CachedToken>>,
	store: Option<Arc<Store>>,
}
impl TokenCache {
	/// Build a token cache with a default HTTP client.
	pub fn new(config: &MirrorConfig) -> Result<Self> {
		let http = Client::builder()
			.user_agent(format!("certview-mirror/{}", env!("CARGO_PKG_VERSION")))
			.connect_timeout(Duration::from_secs(5))
			.build()?;

		Ok(Self::with_client(config, http))
	}

	/// Build a token cache using the supplied HTTP client (primarily for tests).
	pub fn with_client(config: &MirrorConfig, http: Client) -> Self {
		Self {
			auth_url: config.auth_url.clone(),
			payload: config.auth_payload.clone(),
			http,
			retry: RetryPolicy::auth(),
			timeout: config.timeout,
			slot: Mutex::new(None),
			store: None,
		}
	}

	/// Persist every issued token into the store's audit table.
	pub fn with_store(mut self, store: Arc<Store>) -> Self {
		self.store = Some(store);

		self
	}

	/// Override the auth retry policy (primarily for tests).
	pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;

		self
	}

	/// Return a usable credential, fetching a new one when forced, absent, or aged out.
	pub async fn get_token(&self, force_refresh: bool) -> Result<String> {
		let mut slot = self.slot.lock().await;

		if !force_refresh
			&& let Some(cached) = slot.as_ref()
			&& cached.is_fresh(Instant::now())
		{
			return Ok(cached.value.clone());
		}

		tracing::info!(url = %self.auth_url, force_refresh, "fetching new auth token");

		let value = self.fetch_token().await?;

		self.record_issued(&value);

		*slot = Some(CachedToken { value: value.clone(), issued_at: Instant::now() });

		Ok(value)
	}

	async fn fetch_token(&self) -> Result<String> {
		let mut executor = RetryExecutor::new(&self.retry);

		loop {
			match self.post_once().await {
				Ok(token) => return Ok(token),
				Err(err) if is_retriable(&err) && executor.can_retry() => {
					tracing::debug!(error = %err, "transient auth failure; backing off");

					executor.sleep_backoff().await;
				},
				Err(err) => return Err(err),
			}
		}
	}

	async fn post_once(&self) -> Result<String> {
		let response =
			self.http.post(self.auth_url.clone()).json(&self.payload).timeout(self.timeout).send().await?;
		let status = response.status();
		let bytes = response.bytes().await?;

		if !status.is_success() {
			return Err(Error::Auth {
				status: Some(status),
				reason: String::from_utf8_lossy(&bytes).into_owned(),
			});
		}

		Ok(token_from_body(&bytes))
	}

	fn record_issued(&self, value: &str) {
		let Some(store) = &self.store else { return };
		let issued_at = Utc::now();
		let record = TokenRecord {
			value: value.to_owned(),
			issued_at,
			expires_at: issued_at
				+ TimeDelta::from_std(TOKEN_LIFETIME).unwrap_or_else(|_| TimeDelta::hours(4)),
			valid: true,
		};

		if let Err(err) = store.record_token(&record) {
			tracing::warn!(error = %err, "failed to persist issued token");
		}
	}
}

fn is_retriable(error: &Error) -> bool {
	matches!(error, Error::Auth { status: Some(status), .. } if is_transient_status(*status))
}

fn token_from_body(bytes: &[u8]) -> String {
	if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
		for key in ["token", "access_token"] {
			if let Some(token) = value.get(key).and_then(Value::as_str) {
				return token.to_owned();
			}
		}
	}

	String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn token_extraction_prefers_token_then_access_token_then_raw_body() {
		assert_eq!(token_from_body(br#"{"token":"t1","access_token":"t2"}"#), "t1");
		assert_eq!(token_from_body(br#"{"access_token":"t2"}"#), "t2");
		assert_eq!(token_from_body(br#"{"unrelated":true}"#), r#"{"unrelated":true}"#);
		assert_eq!(token_from_body(b"opaque-token"), "opaque-token");
	}

	#[tokio::test]
	async fn cached_token_ages_out_at_refresh_interval() {
		let issued_at = Instant::now();
		let cached = CachedToken { value: "t".into(), issued_at };

		assert!(cached.is_fresh(issued_at + REFRESH_INTERVAL - Duration::from_secs(1)));
		assert!(!cached.is_fresh(issued_at + REFRESH_INTERVAL));
	}
}
