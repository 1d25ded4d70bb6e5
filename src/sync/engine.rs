//! Background sweeper: pagination loop, page-by-page checkpointing, cooperative stop.

// crates.io
use serde_json::Value;
use tokio::{sync::Mutex, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
// self
use crate::{
	_prelude::*,
	http::CertViewClient,
	store::{DEFAULT_ANCHOR, StateUpdate, Store, SyncStatus},
	sync::windows::{self, Interval},
};

/// Grace period allowed for a cancelled worker to drain before it is detached.
pub const JOIN_GRACE: Duration = Duration::from_secs(5);

/// Drives full or resumed sweeps of the upstream time axis.
///
/// At most one sweep is active at a time; the worker polls its cancellation token at
/// every page and window boundary, so a stopped sweep always leaves the checkpoint on
/// the last fully-persisted page.
#[derive(Debug)]
pub struct SyncEngine {
	store: Arc<Store>,
	client: Arc<CertViewClient>,
	page_size: u32,
	worker: Mutex<Option<SyncWorker>>,
}
impl SyncEngine {
	/// Build an engine over the given store and client.
	pub fn new(store: Arc<Store>, client: Arc<CertViewClient>, page_size: u32) -> Self {
		Self { store, client, page_size, worker: Mutex::new(None) }
	}

	/// Start a fresh sweep from the default anchor, clearing the store first.
	pub async fn start_full(&self, interval: Interval) -> Result<()> {
		let mut slot = self.worker.lock().await;

		if worker_active(&slot) {
			return Err(Error::Concurrency("A sync is already running.".into()));
		}

		self.store.clear_data()?;
		self.store.save_state(
			StateUpdate::new()
				.with_valid_from_date(DEFAULT_ANCHOR)
				.with_total_records(0)
				.with_status(SyncStatus::Running),
		)?;

		*slot = Some(self.spawn(interval));

		Ok(())
	}

	/// Resume a sweep from the persisted checkpoint.
	pub async fn resume(&self, interval: Interval) -> Result<()> {
		let mut slot = self.worker.lock().await;

		if worker_active(&slot) {
			return Err(Error::Concurrency("A sync is already running.".into()));
		}

		self.store.save_state(StateUpdate::new().with_status(SyncStatus::Running))?;

		*slot = Some(self.spawn(interval));

		Ok(())
	}

	/// Signal the worker to stop and wait up to [`JOIN_GRACE`] for it to drain.
	///
	/// Returns `false` when no sweep was in progress.
	pub async fn stop(&self) -> Result<bool> {
		let worker = { self.worker.lock().await.take() };
		let Some(worker) = worker else {
			return Ok(false);
		};

		worker.cancel.cancel();

		match time::timeout(JOIN_GRACE, worker.handle).await {
			Ok(Ok(())) => {},
			Ok(Err(err)) => tracing::error!(error = %err, "sync worker terminated abnormally"),
			Err(_) => {
				tracing::warn!("sync worker did not drain within the grace period; detaching");
			},
		}

		Ok(true)
	}

	/// Whether a sweep is currently active.
	pub async fn is_running(&self) -> bool {
		worker_active(&*self.worker.lock().await)
	}

	fn spawn(&self, interval: Interval) -> SyncWorker {
		let cancel = CancellationToken::new();
		let ctx = SweepContext {
			store: self.store.clone(),
			client: self.client.clone(),
			page_size: self.page_size,
			cancel: cancel.clone(),
		};
		let handle = tokio::spawn(run_sweep(ctx, interval));

		SyncWorker { cancel, handle }
	}
}

#[derive(Debug)]
struct SyncWorker {
	cancel: CancellationToken,
	handle: JoinHandle<()>,
}

fn worker_active(slot: &Option<SyncWorker>) -> bool {
	slot.as_ref().is_some_and(|worker| !worker.handle.is_finished())
}

struct SweepContext {
	store: Arc<Store>,
	client: Arc<CertViewClient>,
	page_size: u32,
	cancel: CancellationToken,
}

enum SweepOutcome {
	Completed,
	Cancelled,
}

enum WindowOutcome {
	Drained,
	Cancelled,
}

async fn run_sweep(ctx: SweepContext, interval: Interval) {
	tracing::info!(%interval, "sync sweep starting");

	match sweep(&ctx, interval).await {
		Ok(SweepOutcome::Completed) => {
			persist_status(&ctx.store, SyncStatus::Completed);
			tracing::info!("sync sweep completed");
		},
		Ok(SweepOutcome::Cancelled) => {
			persist_status(&ctx.store, SyncStatus::Stopped);
			tracing::info!("sync sweep stopped");
		},
		Err(err) => {
			tracing::error!(error = %err, "sync sweep failed");
			persist_status(&ctx.store, SyncStatus::Error);
		},
	}
}

async fn sweep(ctx: &SweepContext, interval: Interval) -> Result<SweepOutcome> {
	let state = ctx.store.state()?;
	let checkpoint = windows::parse_timestamp(&state.last_successful_valid_from_date)?;
	// The +1-day bump skips the already-ingested boundary day; records sharing the
	// checkpoint day's timestamp are knowingly left behind.
	let mut cursor = checkpoint + TimeDelta::days(1);
	let now = Utc::now();

	while let Some(window) = windows::plan_window(cursor, interval, now) {
		if ctx.cancel.is_cancelled() {
			return Ok(SweepOutcome::Cancelled);
		}

		let start = windows::format_timestamp(window.start);
		let end = windows::format_timestamp(window.end);

		tracing::info!(%start, %end, "syncing window");

		if let WindowOutcome::Cancelled = sweep_window(ctx, &start, &end).await? {
			return Ok(SweepOutcome::Cancelled);
		}

		cursor = window.next_cursor;
	}

	if ctx.cancel.is_cancelled() { Ok(SweepOutcome::Cancelled) } else { Ok(SweepOutcome::Completed) }
}

async fn sweep_window(ctx: &SweepContext, start: &str, end: &str) -> Result<WindowOutcome> {
	let mut page_number = 0_u32;

	loop {
		if ctx.cancel.is_cancelled() {
			return Ok(WindowOutcome::Cancelled);
		}

		let page = ctx.client.fetch_certificates(start, end, page_number, ctx.page_size).await?;

		if page.is_empty() {
			tracing::debug!(page_number, "empty page; window drained");

			return Ok(WindowOutcome::Drained);
		}

		let returned = page.len();
		let batch = page.into_iter().map(normalize_record).collect::<Vec<_>>();

		ctx.store.save_certificates(&batch)?;

		// Checkpoint advances page-by-page, strictly after the catalog upsert.
		let total = ctx.store.state()?.total_records_collected + returned as u64;
		let mut update = StateUpdate::new().with_total_records(total);

		if let Some(max_date) = max_valid_from_date(&batch) {
			update = update.with_valid_from_date(max_date);
		}

		ctx.store.save_state(update)?;

		tracing::debug!(page_number, returned, total, "page persisted");

		if returned < ctx.page_size as usize {
			return Ok(WindowOutcome::Drained);
		}

		page_number += 1;
	}
}

fn persist_status(store: &Store, status: SyncStatus) {
	if let Err(err) = store.save_state(StateUpdate::new().with_status(status)) {
		tracing::error!(error = %err, %status, "failed to persist terminal sync status");
	}
}

/// Ensure `certhash` is present, falling back to the upstream `sha1` field.
pub(crate) fn normalize_record(mut record: Value) -> Value {
	if record.get("certhash").is_none()
		&& let Some(sha1) = record.get("sha1").cloned()
	{
		record["certhash"] = sha1;
	}

	record
}

fn max_valid_from_date(batch: &[Value]) -> Option<String> {
	batch
		.iter()
		.filter_map(|record| record.get("validFromDate").and_then(Value::as_str))
		.max()
		.map(str::to_owned)
}
