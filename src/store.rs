//! Durable state and catalog store backed by SQLite.
//!
//! The store is the single serialization point for all mutation: one connection behind a
//! mutex, WAL journaling so readers proceed concurrently with the writer.

// std
use std::{
	path::Path,
	sync::{Mutex, MutexGuard, PoisonError},
};
// crates.io
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
// self
use crate::_prelude::*;

/// Checkpoint anchor used before any record has been collected.
pub const DEFAULT_ANCHOR: &str = "1900-01-01T00:00:00Z";
/// Annotation status assigned to certificates that have not been mapped yet.
pub const DEFAULT_MIP_STATUS: &str = "Unknown";

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS sync_state (
	id INTEGER PRIMARY KEY CHECK (id = 1),
	last_successful_valid_from_date TEXT NOT NULL,
	last_sync_timestamp TEXT,
	total_records_collected INTEGER NOT NULL,
	status TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS certificates (
	id TEXT PRIMARY KEY,
	certhash TEXT,
	serial_number TEXT,
	valid_from_date TEXT,
	valid_to_date TEXT,
	key_size INTEGER,
	signature_algorithm TEXT,
	extended_validation INTEGER,
	self_signed INTEGER,
	issuer_name TEXT,
	issuer_organization TEXT,
	subject_name TEXT,
	subject_organization TEXT,
	asset_count INTEGER,
	instance_count INTEGER,
	mapped_to_mip INTEGER NOT NULL DEFAULT 0,
	mip_status TEXT NOT NULL DEFAULT 'Unknown',
	full_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS certificates_serial_number ON certificates (serial_number);
CREATE INDEX IF NOT EXISTS certificates_valid_from_date ON certificates (valid_from_date);
CREATE TABLE IF NOT EXISTS inventory_mapping (
	id INTEGER PRIMARY KEY AUTOINCREMENT,
	serial_number TEXT NOT NULL,
	certificate_name TEXT NOT NULL,
	certificate_status TEXT NOT NULL,
	processed INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS auth_tokens (
	id INTEGER PRIMARY KEY AUTOINCREMENT,
	token_value TEXT NOT NULL,
	issued_at TEXT NOT NULL,
	expires_at TEXT NOT NULL,
	valid INTEGER NOT NULL DEFAULT 1
);
";

/// Lifecycle status of the sync worker as persisted in the state row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
	/// No sweep is active; the checkpoint is resumable.
	Stopped,
	/// A sweep is in progress.
	Running,
	/// The last sweep reached the present without being stopped.
	Completed,
	/// The last sweep terminated on an unrecovered failure.
	Error,
}
impl SyncStatus {
	/// Canonical textual form stored in the state row.
	pub fn as_str(&self) -> &'static str {
		match self {
			SyncStatus::Stopped => "STOPPED",
			SyncStatus::Running => "RUNNING",
			SyncStatus::Completed => "COMPLETED",
			SyncStatus::Error => "ERROR",
		}
	}

	/// Parse the canonical textual form.
	pub fn parse(raw: &str) -> Option<Self> {
		match raw {
			"STOPPED" => Some(SyncStatus::Stopped),
			"RUNNING" => Some(SyncStatus::Running),
			"COMPLETED" => Some(SyncStatus::Completed),
			"ERROR" => Some(SyncStatus::Error),
			_ => None,
		}
	}
}
impl std::fmt::Display for SyncStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Singleton synchronization state record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
	/// Highest `validFromDate` whose page has been fully persisted.
	pub last_successful_valid_from_date: String,
	/// Wall-clock timestamp of the most recent state write.
	pub last_sync_timestamp: Option<DateTime<Utc>>,
	/// Running count of records collected across the sweep.
	pub total_records_collected: u64,
	/// Lifecycle status of the sync worker.
	pub status: SyncStatus,
}
impl Default for SyncState {
	fn default() -> Self {
		Self {
			last_successful_valid_from_date: DEFAULT_ANCHOR.into(),
			last_sync_timestamp: None,
			total_records_collected: 0,
			status: SyncStatus::Stopped,
		}
	}
}

/// Partial update applied to the state row; unset fields keep their current value.
#[derive(Clone, Debug, Default)]
pub struct StateUpdate {
	valid_from_date: Option<String>,
	total_records: Option<u64>,
	status: Option<SyncStatus>,
}
impl StateUpdate {
	/// Create an empty update (still stamps `lastSyncTimestamp`).
	pub fn new() -> Self {
		Self::default()
	}

	/// Set the checkpoint date.
	pub fn with_valid_from_date(mut self, value: impl Into<String>) -> Self {
		self.valid_from_date = Some(value.into());

		self
	}

	/// Set the running record total.
	pub fn with_total_records(mut self, value: u64) -> Self {
		self.total_records = Some(value);

		self
	}

	/// Set the worker status.
	pub fn with_status(mut self, value: SyncStatus) -> Self {
		self.status = Some(value);

		self
	}
}

/// One row of the imported inventory spreadsheet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InventoryMapping {
	/// Serial number used to match a catalog certificate exactly.
	pub serial_number: String,
	/// Display name carried from the spreadsheet.
	pub certificate_name: String,
	/// Status copied onto the matched certificate's `mipStatus`.
	pub certificate_status: String,
	/// Whether the row has been consumed by an apply pass.
	pub processed: bool,
}

/// Audit record of an issued bearer token.
#[derive(Clone, Debug)]
pub struct TokenRecord {
	/// Opaque credential value.
	pub value: String,
	/// Instant the token was issued.
	pub issued_at: DateTime<Utc>,
	/// Instant the upstream considers the token expired.
	pub expires_at: DateTime<Utc>,
	/// Whether the token is the currently active credential.
	pub valid: bool,
}

/// Result of applying one inventory mapping row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingOutcome {
	/// The certificate was annotated by this call.
	Applied,
	/// The certificate was already mapped; left untouched.
	AlreadyMapped,
	/// No certificate carries the serial number.
	NotFound,
}

// Typed projection of the indexed payload fields; everything else stays in `full_json`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Projection {
	certhash: Option<String>,
	valid_from_date: Option<String>,
	valid_to_date: Option<String>,
	serial_number: Option<String>,
	key_size: Option<i64>,
	signature_algorithm: Option<String>,
	extended_validation: Option<bool>,
	self_signed: Option<bool>,
	issuer: Option<Party>,
	subject: Option<Party>,
	asset_count: Option<i64>,
	instance_count: Option<i64>,
}
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Party {
	name: Option<String>,
	organization: Option<String>,
}

/// Atomic, single-writer persistence for the sync state and the certificate catalog.
#[derive(Debug)]
pub struct Store {
	conn: Mutex<Connection>,
}
impl Store {
	/// Open (creating if needed) the database at the given path.
	pub fn open(path: impl AsRef<Path>) -> Result<Self> {
		let conn = Connection::open(path)?;

		conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
		conn.busy_timeout(Duration::from_secs(5))?;

		Self::init(conn)
	}

	/// Open an in-memory database (primarily for tests).
	pub fn in_memory() -> Result<Self> {
		Self::init(Connection::open_in_memory()?)
	}

	fn init(conn: Connection) -> Result<Self> {
		conn.execute_batch(SCHEMA)?;

		Ok(Self { conn: Mutex::new(conn) })
	}

	fn conn(&self) -> MutexGuard<'_, Connection> {
		self.conn.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Current sync state; defaults when no row has been written yet.
	pub fn state(&self) -> Result<SyncState> {
		read_state(&self.conn())
	}

	/// Apply a partial state update atomically, stamping `lastSyncTimestamp` with now.
	///
	/// Returns the state as persisted.
	pub fn save_state(&self, update: StateUpdate) -> Result<SyncState> {
		let mut conn = self.conn();
		let tx = conn.transaction()?;
		let mut state = read_state(&tx)?;

		if let Some(valid_from_date) = update.valid_from_date {
			state.last_successful_valid_from_date = valid_from_date;
		}
		if let Some(total_records) = update.total_records {
			state.total_records_collected = total_records;
		}
		if let Some(status) = update.status {
			state.status = status;
		}

		state.last_sync_timestamp = Some(Utc::now());

		tx.execute(
			"INSERT OR REPLACE INTO sync_state \
			 (id, last_successful_valid_from_date, last_sync_timestamp, total_records_collected, status) \
			 VALUES (1, ?1, ?2, ?3, ?4)",
			params![
				state.last_successful_valid_from_date,
				state.last_sync_timestamp.map(|ts| ts.to_rfc3339()),
				state.total_records_collected as i64,
				state.status.as_str(),
			],
		)?;
		tx.commit()?;

		Ok(state)
	}

	/// Upsert a batch of normalized records by `id` in one transaction.
	///
	/// Records lacking an `id` are skipped silently; numeric ids are stringified. The
	/// full payload is preserved in `full_json` and the local annotation columns are
	/// never touched by an upsert. Returns the number of rows written.
	pub fn save_certificates(&self, records: &[Value]) -> Result<usize> {
		let mut conn = self.conn();
		let tx = conn.transaction()?;
		let mut saved = 0_usize;

		{
			let mut stmt = tx.prepare(
				"INSERT INTO certificates \
				 (id, certhash, serial_number, valid_from_date, valid_to_date, key_size, \
				  signature_algorithm, extended_validation, self_signed, issuer_name, \
				  issuer_organization, subject_name, subject_organization, asset_count, \
				  instance_count, full_json) \
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16) \
				 ON CONFLICT (id) DO UPDATE SET \
				  certhash = excluded.certhash, \
				  serial_number = excluded.serial_number, \
				  valid_from_date = excluded.valid_from_date, \
				  valid_to_date = excluded.valid_to_date, \
				  key_size = excluded.key_size, \
				  signature_algorithm = excluded.signature_algorithm, \
				  extended_validation = excluded.extended_validation, \
				  self_signed = excluded.self_signed, \
				  issuer_name = excluded.issuer_name, \
				  issuer_organization = excluded.issuer_organization, \
				  subject_name = excluded.subject_name, \
				  subject_organization = excluded.subject_organization, \
				  asset_count = excluded.asset_count, \
				  instance_count = excluded.instance_count, \
				  full_json = excluded.full_json",
			)?;

			for record in records {
				let Some(id) = record_id(record) else {
					tracing::debug!("skipping record without an id");

					continue;
				};
				let projection =
					serde_json::from_value::<Projection>(record.clone()).unwrap_or_default();
				let issuer = projection.issuer.unwrap_or_default();
				let subject = projection.subject.unwrap_or_default();
				let full_json = serde_json::to_string(record)?;

				stmt.execute(params![
					id,
					projection.certhash,
					projection.serial_number,
					projection.valid_from_date,
					projection.valid_to_date,
					projection.key_size,
					projection.signature_algorithm,
					projection.extended_validation,
					projection.self_signed,
					issuer.name,
					issuer.organization,
					subject.name,
					subject.organization,
					projection.asset_count,
					projection.instance_count,
					full_json,
				])?;

				saved += 1;
			}
		}

		tx.commit()?;

		Ok(saved)
	}

	/// Full catalog ordered by `validFromDate` descending, with the local annotation
	/// fields merged into each returned payload.
	pub fn all_certificates(&self) -> Result<Vec<Value>> {
		let conn = self.conn();
		let mut stmt = conn.prepare(
			"SELECT full_json, mapped_to_mip, mip_status FROM certificates \
			 ORDER BY valid_from_date DESC",
		)?;
		let rows = stmt.query_map([], |row| {
			Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?, row.get::<_, String>(2)?))
		})?;
		let mut certificates = Vec::new();

		for row in rows {
			let (full_json, mapped_to_mip, mip_status) = row?;
			let mut payload = serde_json::from_str::<Value>(&full_json)?;

			if let Some(object) = payload.as_object_mut() {
				object.insert("mappedToMip".into(), Value::Bool(mapped_to_mip));
				object.insert("mipStatus".into(), Value::String(mip_status));
			}

			certificates.push(payload);
		}

		Ok(certificates)
	}

	/// Delete every certificate and the sync-state row.
	pub fn clear_data(&self) -> Result<()> {
		let mut conn = self.conn();
		let tx = conn.transaction()?;

		tx.execute("DELETE FROM certificates", [])?;
		tx.execute("DELETE FROM sync_state", [])?;
		tx.commit()?;

		Ok(())
	}

	/// Truncate the inventory table and bulk-insert the given rows in one transaction.
	pub fn replace_mappings(&self, rows: &[InventoryMapping]) -> Result<usize> {
		let mut conn = self.conn();
		let tx = conn.transaction()?;

		tx.execute("DELETE FROM inventory_mapping", [])?;

		{
			let mut stmt = tx.prepare(
				"INSERT INTO inventory_mapping \
				 (serial_number, certificate_name, certificate_status, processed) \
				 VALUES (?1, ?2, ?3, ?4)",
			)?;

			for row in rows {
				stmt.execute(params![
					row.serial_number,
					row.certificate_name,
					row.certificate_status,
					row.processed,
				])?;
			}
		}

		tx.commit()?;

		Ok(rows.len())
	}

	/// All inventory rows in insertion order.
	pub fn mappings(&self) -> Result<Vec<InventoryMapping>> {
		let conn = self.conn();
		let mut stmt = conn.prepare(
			"SELECT serial_number, certificate_name, certificate_status, processed \
			 FROM inventory_mapping ORDER BY id",
		)?;
		let rows = stmt.query_map([], |row| {
			Ok(InventoryMapping {
				serial_number: row.get(0)?,
				certificate_name: row.get(1)?,
				certificate_status: row.get(2)?,
				processed: row.get(3)?,
			})
		})?;

		rows.map(|row| Ok(row?)).collect()
	}

	/// Annotate the certificate matching the serial number exactly, in one transaction.
	///
	/// The annotation is monotonic: an already-mapped certificate is left untouched.
	pub fn apply_mapping(
		&self,
		serial_number: &str,
		certificate_status: &str,
	) -> Result<MappingOutcome> {
		let mut conn = self.conn();
		let tx = conn.transaction()?;
		let row = tx
			.query_row(
				"SELECT id, mapped_to_mip FROM certificates WHERE serial_number = ?1 LIMIT 1",
				params![serial_number],
				|row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
			)
			.optional()?;
		let outcome = match row {
			None => MappingOutcome::NotFound,
			Some((_, true)) => MappingOutcome::AlreadyMapped,
			Some((id, false)) => {
				tx.execute(
					"UPDATE certificates SET mapped_to_mip = 1, mip_status = ?1 WHERE id = ?2",
					params![certificate_status, id],
				)?;

				MappingOutcome::Applied
			},
		};

		tx.commit()?;

		Ok(outcome)
	}

	/// Append an issued token to the audit table, invalidating prior entries.
	pub fn record_token(&self, record: &TokenRecord) -> Result<()> {
		let mut conn = self.conn();
		let tx = conn.transaction()?;

		tx.execute("UPDATE auth_tokens SET valid = 0 WHERE valid = 1", [])?;
		tx.execute(
			"INSERT INTO auth_tokens (token_value, issued_at, expires_at, valid) \
			 VALUES (?1, ?2, ?3, ?4)",
			params![
				record.value,
				record.issued_at.to_rfc3339(),
				record.expires_at.to_rfc3339(),
				record.valid,
			],
		)?;
		tx.commit()?;

		Ok(())
	}
}

fn read_state(conn: &Connection) -> Result<SyncState> {
	let row = conn
		.query_row(
			"SELECT last_successful_valid_from_date, last_sync_timestamp, \
			 total_records_collected, status FROM sync_state WHERE id = 1",
			[],
			|row| {
				Ok((
					row.get::<_, String>(0)?,
					row.get::<_, Option<String>>(1)?,
					row.get::<_, i64>(2)?,
					row.get::<_, String>(3)?,
				))
			},
		)
		.optional()?;
	let Some((valid_from_date, timestamp, total, status)) = row else {
		return Ok(SyncState::default());
	};

	Ok(SyncState {
		last_successful_valid_from_date: valid_from_date,
		last_sync_timestamp: timestamp
			.and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
			.map(|ts| ts.with_timezone(&Utc)),
		total_records_collected: total.max(0) as u64,
		status: SyncStatus::parse(&status).unwrap_or(SyncStatus::Stopped),
	})
}

fn record_id(record: &Value) -> Option<String> {
	match record.get("id")? {
		Value::String(id) if !id.is_empty() => Some(id.clone()),
		Value::Number(id) => Some(id.to_string()),
		_ => None,
	}
}
