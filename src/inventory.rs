//! Inventory annotation: tabular import and one-shot background catalog enrichment.

// std
use std::{
	fs::File,
	io::Read,
	path::Path,
	sync::atomic::{AtomicBool, Ordering},
};
// crates.io
use tokio::{sync::Mutex, task::JoinHandle};
// self
use crate::{
	_prelude::*,
	store::{InventoryMapping, MappingOutcome, Store},
};

/// Columns the inventory file must carry; matched case-insensitively after trimming.
pub const REQUIRED_COLUMNS: [&str; 3] =
	["certificate serial number", "certificate name", "certificate status"];

/// One-shot enrichment of catalog certificates from a tabular inventory file.
///
/// Import is synchronous; the apply pass runs on a single background task and cannot
/// run concurrently with itself.
#[derive(Debug)]
pub struct AnnotationWorker {
	store: Arc<Store>,
	running: Arc<AtomicBool>,
	handle: Mutex<Option<JoinHandle<()>>>,
}
impl AnnotationWorker {
	/// Build a worker over the given store.
	pub fn new(store: Arc<Store>) -> Self {
		Self { store, running: Arc::new(AtomicBool::new(false)), handle: Mutex::new(None) }
	}

	/// Parse the inventory file at `path` and stage its rows, truncating previous ones.
	pub fn import_from_path(&self, path: impl AsRef<Path>) -> Result<usize> {
		self.import_from_reader(File::open(path)?)
	}

	/// Parse inventory rows from a reader and stage them, truncating previous ones.
	pub fn import_from_reader(&self, reader: impl Read) -> Result<usize> {
		let rows = parse_inventory(reader)?;
		let count = self.store.replace_mappings(&rows)?;

		tracing::info!(count, "inventory mappings imported");

		Ok(count)
	}

	/// Start the background apply pass; a second call while one runs is rejected.
	pub async fn start(&self) -> Result<()> {
		let mut slot = self.handle.lock().await;

		if self.running.load(Ordering::SeqCst)
			|| slot.as_ref().is_some_and(|handle| !handle.is_finished())
		{
			return Err(Error::Concurrency("Mapping process is already running.".into()));
		}

		self.running.store(true, Ordering::SeqCst);

		let store = self.store.clone();
		let guard = RunningGuard(self.running.clone());

		*slot = Some(tokio::spawn(async move {
			let _guard = guard;

			apply_all(&store);
		}));

		Ok(())
	}

	/// Whether an apply pass is currently running.
	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}
}

struct RunningGuard(Arc<AtomicBool>);
impl Drop for RunningGuard {
	fn drop(&mut self) {
		self.0.store(false, Ordering::SeqCst);
	}
}

fn apply_all(store: &Store) {
	let mappings = match store.mappings() {
		Ok(mappings) => mappings,
		Err(err) => {
			tracing::error!(error = %err, "failed to read inventory mappings");

			return;
		},
	};
	let total = mappings.len();
	let mut applied = 0_usize;

	for mapping in &mappings {
		match store.apply_mapping(&mapping.serial_number, &mapping.certificate_status) {
			Ok(MappingOutcome::Applied) => applied += 1,
			Ok(MappingOutcome::AlreadyMapped) => {
				tracing::debug!(serial = %mapping.serial_number, "already mapped; skipping");
			},
			Ok(MappingOutcome::NotFound) => {
				tracing::debug!(serial = %mapping.serial_number, "no matching certificate");
			},
			Err(err) => {
				tracing::warn!(
					serial = %mapping.serial_number,
					error = %err,
					"failed to annotate certificate; skipping row"
				);
			},
		}
	}

	tracing::info!(total, applied, "inventory mapping pass completed");
}

fn parse_inventory(reader: impl Read) -> Result<Vec<InventoryMapping>> {
	let mut csv_reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
	let headers = csv_reader
		.headers()?
		.iter()
		.map(|header| header.trim().to_ascii_lowercase())
		.collect::<Vec<_>>();
	let mut indices = [0_usize; 3];
	let mut missing = Vec::new();

	for (slot, column) in indices.iter_mut().zip(REQUIRED_COLUMNS) {
		match headers.iter().position(|header| header == column) {
			Some(index) => *slot = index,
			None => missing.push(column),
		}
	}

	if !missing.is_empty() {
		return Err(Error::Input(format!("Missing columns: {}", missing.join(", "))));
	}

	let [serial_index, name_index, status_index] = indices;
	let mut rows = Vec::new();

	for record in csv_reader.records() {
		let record = record?;
		let field = |index: usize| record.get(index).unwrap_or_default().trim().to_owned();

		rows.push(InventoryMapping {
			serial_number: field(serial_index),
			certificate_name: field(name_index),
			certificate_status: field(status_index),
			processed: false,
		});
	}

	Ok(rows)
}
