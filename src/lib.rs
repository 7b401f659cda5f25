//! Local watch-progress tracking with remote sync.
//!
//! A [`tracker::ProgressTracker`] keeps a JSON table of the last episode
//! watched per title, broadcasts changes, accepts player events from an
//! origin allow-list and mirrors changes to a per-user remote document.

pub mod config;
pub mod events;
pub mod history;
pub mod projector;
pub mod providers;
pub mod remote;
pub mod tracker;
pub mod types;

pub use tracker::ProgressTracker;
