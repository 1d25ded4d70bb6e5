//! Control surface: process-wide service container and operator commands.
//!
//! Commands return `Result<String>` — the success message on `Ok`, the rejection on
//! `Err` — leaving the outer HTTP façade to map them onto status codes.

// std
use std::{io::Read, path::Path};
// crates.io
use serde_json::Value;
// self
use crate::{
	_prelude::*,
	config::MirrorConfig,
	http::CertViewClient,
	inventory::AnnotationWorker,
	store::{Store, SyncState},
	sync::{Interval, SyncEngine},
	token::TokenCache,
};

/// Fixed column order of the export snapshot; dotted names resolve nested objects.
pub const EXPORT_COLUMNS: [&str; 17] = [
	"id",
	"certhash",
	"validFromDate",
	"validToDate",
	"issuer.name",
	"subject.name",
	"keySize",
	"serialNumber",
	"signatureAlgorithm",
	"extendedValidation",
	"selfSigned",
	"issuer.organization",
	"subject.organization",
	"assetCount",
	"instanceCount",
	"sources",
	"assets",
];

/// Number of leading characters echoed back after a forced token refresh.
const TOKEN_PREVIEW_CHARS: usize = 12;

/// Dependency container bundling the store, token cache, sync engine, and annotation
/// worker behind the operator command surface.
#[derive(Debug)]
pub struct MirrorService {
	store: Arc<Store>,
	tokens: Arc<TokenCache>,
	sync: SyncEngine,
	inventory: AnnotationWorker,
}
impl MirrorService {
	/// Build the full service from a validated configuration.
	pub fn new(config: MirrorConfig) -> Result<Self> {
		config.validate()?;

		let store = Arc::new(Store::open(&config.database_path)?);
		let tokens = Arc::new(TokenCache::new(&config)?.with_store(store.clone()));
		let client = Arc::new(CertViewClient::new(&config, tokens.clone())?);
		let sync = SyncEngine::new(store.clone(), client, config.page_size);
		let inventory = AnnotationWorker::new(store.clone());

		Ok(Self { store, tokens, sync, inventory })
	}

	/// Shared store handle for thin adapters (status pages, importers, tests).
	pub fn store(&self) -> &Arc<Store> {
		&self.store
	}

	/// Start a fresh sweep from the default anchor; rejected while one is running.
	pub async fn start_full_sync(&self, interval: Interval) -> Result<String> {
		self.sync.start_full(interval).await?;

		Ok(format!("Full sync started with {interval} windows."))
	}

	/// Resume the sweep from the persisted checkpoint; rejected while one is running.
	pub async fn resume_sync(&self, interval: Interval) -> Result<String> {
		self.sync.resume(interval).await?;

		Ok("Sync resumed from the last checkpoint.".into())
	}

	/// Stop the active sweep; a no-op when none is running.
	pub async fn stop_sync(&self) -> Result<String> {
		if self.sync.stop().await? {
			Ok("Sync stopped.".into())
		} else {
			Ok("No sync in progress.".into())
		}
	}

	/// Clear the store; rejected while a sweep is running.
	pub async fn reset(&self) -> Result<String> {
		if self.sync.is_running().await {
			return Err(Error::Concurrency("Cannot reset while a sync is running.".into()));
		}

		self.store.clear_data()?;

		Ok("Store cleared.".into())
	}

	/// Current sync state record.
	pub fn status(&self) -> Result<SyncState> {
		self.store.state()
	}

	/// Whether a sweep is currently active.
	pub async fn sync_running(&self) -> bool {
		self.sync.is_running().await
	}

	/// Full catalog projected onto the fixed export column order.
	pub fn export_snapshot(&self) -> Result<ExportDocument> {
		Ok(project_columns(&self.store.all_certificates()?))
	}

	/// Force a credential refresh and echo a truncated prefix for confirmation.
	pub async fn force_refresh_token(&self) -> Result<String> {
		let token = self.tokens.get_token(true).await?;

		Ok(format!("Token refreshed; prefix {}.", token_preview(&token)))
	}

	/// Import inventory rows from a reader, replacing previously staged ones.
	pub fn import_inventory(&self, reader: impl Read) -> Result<String> {
		let count = self.inventory.import_from_reader(reader)?;

		Ok(format!("Successfully imported {count} records."))
	}

	/// Import inventory rows from a file path, replacing previously staged ones.
	pub fn import_inventory_path(&self, path: impl AsRef<Path>) -> Result<String> {
		let count = self.inventory.import_from_path(path)?;

		Ok(format!("Successfully imported {count} records."))
	}

	/// Start the background annotation pass over the staged inventory.
	pub async fn start_annotation(&self) -> Result<String> {
		self.inventory.start().await?;

		Ok("Mapping process started.".into())
	}

	/// Whether the annotation pass is currently running.
	pub fn annotation_running(&self) -> bool {
		self.inventory.is_running()
	}
}

/// Catalog snapshot projected onto the fixed export column order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportDocument {
	/// Column headers actually present in the dataset, in the fixed order.
	pub columns: Vec<&'static str>,
	/// One row of rendered cells per certificate.
	pub rows: Vec<Vec<String>>,
}
impl ExportDocument {
	/// Render the snapshot as CSV bytes for the download façade.
	pub fn to_csv(&self) -> Result<Vec<u8>> {
		let mut writer = csv::Writer::from_writer(Vec::new());

		writer.write_record(&self.columns)?;

		for row in &self.rows {
			writer.write_record(row)?;
		}

		writer.into_inner().map_err(|err| Error::Io(err.into_error()))
	}
}

fn project_columns(certificates: &[Value]) -> ExportDocument {
	let columns = EXPORT_COLUMNS
		.iter()
		.copied()
		.filter(|column| certificates.iter().any(|payload| column_value(payload, column).is_some()))
		.collect::<Vec<_>>();
	let rows = certificates
		.iter()
		.map(|payload| {
			columns
				.iter()
				.map(|column| column_value(payload, column).map(render_cell).unwrap_or_default())
				.collect()
		})
		.collect();

	ExportDocument { columns, rows }
}

// Dotted names resolve nested objects, falling back to a literal flat key; nulls
// count as missing.
fn column_value<'a>(payload: &'a Value, column: &str) -> Option<&'a Value> {
	column
		.split('.')
		.try_fold(payload, |value, segment| value.get(segment))
		.filter(|value| !value.is_null())
		.or_else(|| payload.get(column).filter(|value| !value.is_null()))
}

fn render_cell(value: &Value) -> String {
	match value {
		Value::String(text) => text.clone(),
		other => other.to_string(),
	}
}

fn token_preview(token: &str) -> String {
	let prefix = token.chars().take(TOKEN_PREVIEW_CHARS).collect::<String>();

	if token.chars().count() > TOKEN_PREVIEW_CHARS { format!("{prefix}…") } else { prefix }
}
