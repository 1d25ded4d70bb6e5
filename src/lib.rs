//! Incremental mirror of a remote certificate inventory — windowed paging sync with durable
//! checkpoints, single-flight token refresh, and inventory annotation.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod control;
pub mod http;
pub mod inventory;
pub mod store;
pub mod sync;
pub mod token;

mod config;
mod error;
mod _prelude {
	pub use std::sync::Arc;
	pub use std::time::Duration;

	pub use chrono::{DateTime, TimeDelta, Utc};
	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}
pub use crate::{
	config::MirrorConfig,
	control::{ExportDocument, MirrorService},
	error::{Error, Result},
	store::{Store, SyncState, SyncStatus},
	sync::{Interval, SyncEngine},
	token::TokenCache,
};
