//! HTTP client for the upstream certificate list endpoint.

// crates.io
use reqwest::Client;
use serde_json::{Value, json};
use url::Url;
// self
use crate::{
	_prelude::*,
	config::MirrorConfig,
	http::retry::{RetryExecutor, RetryPolicy, is_transient_status},
	token::TokenCache,
};

/// Client issuing one page request at a time against the upstream list endpoint.
///
/// Authentication and transient upstream failures are handled internally; an error
/// escaping [`fetch_certificates`](CertViewClient::fetch_certificates) is terminal
/// for the current sweep.
#[derive(Debug)]
pub struct CertViewClient {
	http: Client,
	list_url: Url,
	tokens: Arc<TokenCache>,
	retry: RetryPolicy,
	timeout: Duration,
}
impl CertViewClient {
	/// Build a new client from the mirror configuration.
	pub fn new(config: &MirrorConfig, tokens: Arc<TokenCache>) -> Result<Self> {
		let http = Client::builder()
			.user_agent(format!("certview-mirror/{}", env!("CARGO_PKG_VERSION")))
			.connect_timeout(Duration::from_secs(5))
			.build()?;

		Ok(Self {
			http,
			list_url: config.list_url()?,
			tokens,
			retry: RetryPolicy::transport(),
			timeout: config.timeout,
		})
	}

	/// Override the transport retry policy (primarily for tests).
	pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;

		self
	}

	/// Fetch one page of certificates whose `validFromDate` falls within the window.
	///
	/// A 401/403 triggers at most one top-level retry with a force-refreshed token;
	/// transient statuses are retried at the transport layer. A successful empty
	/// array is the end-of-range signal.
	#[tracing::instrument(skip(self))]
	pub async fn fetch_certificates(
		&self,
		start_date: &str,
		end_date: &str,
		page_number: u32,
		page_size: u32,
	) -> Result<Vec<Value>> {
		let body = list_request_body(start_date, end_date, page_number, page_size);
		let mut force_refresh = false;

		loop {
			let token = self.tokens.get_token(force_refresh).await?;

			match self.post_with_retry(&body, &token).await {
				Err(err) if err.is_auth_rejection() && !force_refresh => {
					tracing::warn!(error = %err, "auth rejected; retrying with a fresh token");

					force_refresh = true;
				},
				other => return other,
			}
		}
	}

	async fn post_with_retry(&self, body: &Value, token: &str) -> Result<Vec<Value>> {
		let mut executor = RetryExecutor::new(&self.retry);

		loop {
			match self.post_once(body, token).await {
				Ok(records) => return Ok(records),
				Err(err) if is_retriable(&err) && executor.can_retry() => {
					tracing::debug!(error = %err, "transient upstream failure; backing off");

					executor.sleep_backoff().await;
				},
				Err(err) => return Err(err),
			}
		}
	}

	async fn post_once(&self, body: &Value, token: &str) -> Result<Vec<Value>> {
		let response = self
			.http
			.post(self.list_url.clone())
			.bearer_auth(token)
			.json(body)
			.timeout(self.timeout)
			.send()
			.await?;
		let status = response.status();

		if !status.is_success() {
			let body = response.text().await.ok();

			return Err(Error::Upstream { status, url: self.list_url.clone(), body });
		}

		let records = response.json::<Vec<Value>>().await?;

		tracing::debug!(count = records.len(), "list page fetched");

		Ok(records)
	}
}

fn is_retriable(error: &Error) -> bool {
	match error {
		Error::Upstream { status, .. } => is_transient_status(*status),
		Error::Transport(err) => err.is_timeout() || err.is_connect(),
		_ => false,
	}
}

/// Assemble the list request body for one page of a window.
pub fn list_request_body(
	start_date: &str,
	end_date: &str,
	page_number: u32,
	page_size: u32,
) -> Value {
	json!({
		"filter": {
			"filters": [
				{ "field": "certificate.type", "value": "Leaf", "operator": "EQUALS" },
				{
					"field": "certificate.validFromDate",
					"value": start_date,
					"operator": "GREATER_THAN_EQUAL"
				},
				{
					"field": "certificate.validFromDate",
					"value": end_date,
					"operator": "LESS_THAN_EQUAL"
				}
			],
			"operation": "AND"
		},
		"pageNumber": page_number,
		"pageSize": page_size
	})
}
