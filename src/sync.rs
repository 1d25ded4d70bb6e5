//! Windowed paging sync engine: window planner and cancellable background sweeper.

pub mod engine;
pub mod windows;

pub use self::{engine::SyncEngine, windows::Interval};
