//! Spreadsheet-backed API: turns a resource name into rows.

mod api_types;
mod client;

pub use api_types::ROW_FIELD;
pub use client::SheetsClient;
