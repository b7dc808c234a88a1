//! Employee task dashboard over a spreadsheet-backed API.
//!
//! The interesting part lives in [`cache`]: a per-subject, per-resource
//! snapshot cache with stale-while-revalidate loading, background refresh and
//! new-record detection.

pub mod app;
pub mod cache;
pub mod config;
pub mod event;
pub mod logging;
pub mod read_status;
pub mod sheets;
