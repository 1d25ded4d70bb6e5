//! End-to-end sweep scenarios against a mock upstream.

// std
use std::{
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
	time::{Duration, Instant},
};
// crates.io
use certview_mirror::{
	Interval, MirrorConfig, MirrorService, Result, SyncStatus,
	store::StateUpdate,
};
use serde_json::{Value, json};
use tempfile::TempDir;
use wiremock::{
	Mock, MockServer, Request, ResponseTemplate,
	matchers::{method, path},
};

const AUTH_PATH: &str = "/auth/token";
const LIST_PATH: &str = "/certview/v2/certificates/list";

fn service_for(server: &MockServer, tmp: &TempDir) -> Result<MirrorService> {
	let config = MirrorConfig::new(server.uri())?
		.with_auth_payload(json!({ "username": "u", "password": "p" }))
		.with_database_path(tmp.path().join("mirror.db"));

	MirrorService::new(config)
}

async fn mount_auth(server: &MockServer) {
	Mock::given(method("POST"))
		.and(path(AUTH_PATH))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "tok" })))
		.mount(server)
		.await;
}

fn body_of(request: &Request) -> Value {
	serde_json::from_slice(&request.body).expect("request body")
}

fn window_start(body: &Value) -> String {
	body["filter"]["filters"][1]["value"].as_str().unwrap_or_default().to_owned()
}

fn record(id: &str, valid_from: &str) -> Value {
	json!({
		"id": id,
		"sha1": format!("sha1-{id}"),
		"serialNumber": format!("serial-{id}"),
		"validFromDate": valid_from,
	})
}

async fn wait_for_terminal(service: &MirrorService) -> SyncStatus {
	for _ in 0..400 {
		let status = service.status().expect("status").status;

		if status != SyncStatus::Running {
			return status;
		}

		tokio::time::sleep(Duration::from_millis(50)).await;
	}

	panic!("sweep did not reach a terminal status in time");
}

#[tokio::test]
async fn cold_full_sync_collects_every_page() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	mount_auth(&server).await;

	// Three pages for the opening year, nothing elsewhere: 50 + 50 + 20 records.
	Mock::given(method("POST"))
		.and(path(LIST_PATH))
		.respond_with(move |request: &Request| {
			let body = body_of(request);

			if !window_start(&body).starts_with("1900") {
				return ResponseTemplate::new(200).set_body_json(json!([]));
			}

			let page = body["pageNumber"].as_u64().unwrap_or_default();
			let count = match page {
				0 | 1 => 50,
				2 => 20,
				_ => 0,
			};
			let offset = page * 50;
			let records = (0..count)
				.map(|i| {
					record(
						&format!("cert-{}", offset + i),
						&format!("1900-03-{:02}T12:00:00Z", (offset + i) % 28 + 1),
					)
				})
				.collect::<Vec<_>>();

			ResponseTemplate::new(200).set_body_json(records)
		})
		.mount(&server)
		.await;

	let tmp = TempDir::new()?;
	let service = service_for(&server, &tmp)?;

	service.start_full_sync(Interval::Yearly).await?;

	assert_eq!(wait_for_terminal(&service).await, SyncStatus::Completed);

	let state = service.status()?;

	assert_eq!(state.total_records_collected, 120);
	assert_eq!(state.last_successful_valid_from_date, "1900-03-28T12:00:00Z");
	assert_eq!(service.store().all_certificates()?.len(), 120);
	Ok(())
}

#[tokio::test]
async fn resume_opens_the_next_monthly_window_after_the_checkpoint() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	mount_auth(&server).await;
	Mock::given(method("POST"))
		.and(path(LIST_PATH))
		.respond_with(move |request: &Request| {
			let body = body_of(request);
			let page = body["pageNumber"].as_u64().unwrap_or_default();

			if window_start(&body) == "2020-06-16T00:00:00Z" && page == 0 {
				let records = (0..50)
					.map(|i| record(&format!("june-{i}"), "2020-06-20T08:00:00Z"))
					.collect::<Vec<_>>();

				ResponseTemplate::new(200).set_body_json(records)
			} else {
				ResponseTemplate::new(200).set_body_json(json!([]))
			}
		})
		.mount(&server)
		.await;

	let tmp = TempDir::new()?;
	let service = service_for(&server, &tmp)?;

	service.store().save_state(
		StateUpdate::new()
			.with_valid_from_date("2020-06-15T00:00:00Z")
			.with_total_records(500)
			.with_status(SyncStatus::Stopped),
	)?;
	service.resume_sync(Interval::Monthly).await?;

	assert_eq!(wait_for_terminal(&service).await, SyncStatus::Completed);
	assert_eq!(service.status()?.total_records_collected, 550);

	let requests = server.received_requests().await.expect("recorded requests");
	let first_list = requests
		.iter()
		.find(|request| request.url.path() == LIST_PATH)
		.expect("list request");
	let body = body_of(first_list);

	// The checkpoint day itself is skipped; the window covers the rest of June.
	assert_eq!(body["filter"]["filters"][1]["value"], "2020-06-16T00:00:00Z");
	assert_eq!(body["filter"]["filters"][2]["value"], "2020-06-30T23:59:59Z");
	assert_eq!(body["filter"]["filters"][0]["value"], "Leaf");
	Ok(())
}

#[tokio::test]
async fn stop_between_pages_leaves_a_resumable_checkpoint() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	mount_auth(&server).await;

	// An endless supply of full pages, one day per page, slowed enough to stop mid-window.
	Mock::given(method("POST"))
		.and(path(LIST_PATH))
		.respond_with(move |request: &Request| {
			let body = body_of(request);
			let page = body["pageNumber"].as_u64().unwrap_or_default();
			let records = (0..50)
				.map(|i| {
					record(
						&format!("cert-{page}-{i}"),
						&format!("1900-01-{:02}T00:00:00Z", page + 1),
					)
				})
				.collect::<Vec<_>>();

			ResponseTemplate::new(200)
				.set_delay(Duration::from_millis(100))
				.set_body_json(records)
		})
		.mount(&server)
		.await;

	let tmp = TempDir::new()?;
	let service = service_for(&server, &tmp)?;

	service.start_full_sync(Interval::Yearly).await?;
	tokio::time::sleep(Duration::from_millis(350)).await;

	let stop_started = Instant::now();
	let message = service.stop_sync().await?;

	assert!(stop_started.elapsed() < Duration::from_secs(5));
	assert_eq!(message, "Sync stopped.");

	let state = service.status()?;

	assert_eq!(state.status, SyncStatus::Stopped);

	let total = state.total_records_collected;

	assert!(total > 0, "at least one page must have been persisted");
	assert_eq!(total % 50, 0, "checkpoint must land on a page boundary");

	let pages = total / 50;

	// The checkpoint reflects the last fully-persisted page.
	assert_eq!(state.last_successful_valid_from_date, format!("1900-01-{pages:02}T00:00:00Z"));
	assert_eq!(service.store().all_certificates()?.len(), total as usize);

	// A stopped sweep is idempotently stoppable.
	assert_eq!(service.stop_sync().await?, "No sync in progress.");
	Ok(())
}

#[tokio::test]
async fn reset_and_restart_are_rejected_while_a_sweep_runs() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	mount_auth(&server).await;
	Mock::given(method("POST"))
		.and(path(LIST_PATH))
		.respond_with(move |request: &Request| {
			let body = body_of(request);
			let page = body["pageNumber"].as_u64().unwrap_or_default();
			let records = (0..50)
				.map(|i| record(&format!("cert-{page}-{i}"), "1900-02-01T00:00:00Z"))
				.collect::<Vec<_>>();

			ResponseTemplate::new(200)
				.set_delay(Duration::from_millis(200))
				.set_body_json(records)
		})
		.mount(&server)
		.await;

	let tmp = TempDir::new()?;
	let service = service_for(&server, &tmp)?;

	service.start_full_sync(Interval::Yearly).await?;
	tokio::time::sleep(Duration::from_millis(100)).await;

	assert!(matches!(service.reset().await, Err(certview_mirror::Error::Concurrency(_))));
	assert!(matches!(
		service.start_full_sync(Interval::Yearly).await,
		Err(certview_mirror::Error::Concurrency(_))
	));
	assert!(matches!(
		service.resume_sync(Interval::Yearly).await,
		Err(certview_mirror::Error::Concurrency(_))
	));
	// The rejections left the sweep untouched.
	assert_eq!(service.status()?.status, SyncStatus::Running);

	service.stop_sync().await?;
	Ok(())
}

#[tokio::test]
async fn sweep_over_an_empty_upstream_completes_without_moving_the_checkpoint() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	mount_auth(&server).await;
	Mock::given(method("POST"))
		.and(path(LIST_PATH))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
		.mount(&server)
		.await;

	let tmp = TempDir::new()?;
	let service = service_for(&server, &tmp)?;

	service.start_full_sync(Interval::Yearly).await?;

	assert_eq!(wait_for_terminal(&service).await, SyncStatus::Completed);

	let state = service.status()?;

	assert_eq!(state.total_records_collected, 0);
	assert_eq!(state.last_successful_valid_from_date, "1900-01-01T00:00:00Z");
	Ok(())
}

#[tokio::test]
async fn upstream_failure_marks_the_sweep_errored_and_resume_recovers() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	mount_auth(&server).await;

	let counter = Arc::new(AtomicUsize::new(0));
	let counter_handle = counter.clone();

	Mock::given(method("POST"))
		.and(path(LIST_PATH))
		.respond_with(move |_: &Request| {
			if counter_handle.fetch_add(1, Ordering::SeqCst) == 0 {
				// Non-transient upstream failure; terminal for the sweep.
				ResponseTemplate::new(400).set_body_string("bad filter")
			} else {
				ResponseTemplate::new(200).set_body_json(json!([]))
			}
		})
		.mount(&server)
		.await;

	let tmp = TempDir::new()?;
	let service = service_for(&server, &tmp)?;

	service.start_full_sync(Interval::Yearly).await?;

	assert_eq!(wait_for_terminal(&service).await, SyncStatus::Error);

	service.resume_sync(Interval::Yearly).await?;

	assert_eq!(wait_for_terminal(&service).await, SyncStatus::Completed);
	Ok(())
}
