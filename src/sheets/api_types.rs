//! Serde-deserializable types matching spreadsheet API responses.
//!
//! The API answers in a few shapes depending on how the sheet was published;
//! everything is normalized to a list of JSON objects, one per row.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::cache::Record;

/// Field added to rows that arrive as a header + values grid.
pub const ROW_FIELD: &str = "_row";

// ============================================================================
// Response envelope
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ApiResponse {
  /// `[ {...}, {...} ]` or `[ ["h1", "h2"], [v1, v2] ]`
  Rows(Vec<Value>),
  /// `{ "success": bool, "data": [...], "error": "..." }`
  Envelope(ApiEnvelope),
}

/// Object-shaped response. Only an envelope carrying `data` is a success;
/// any other object (an error page, a status report) is a failed fetch.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope {
  #[serde(default = "default_success")]
  pub success: bool,
  pub data: Option<Vec<Value>>,
  pub error: Option<String>,
  pub message: Option<String>,
}

fn default_success() -> bool {
  true
}

// ============================================================================
// Conversions to records
// ============================================================================

impl ApiResponse {
  pub fn into_records(self) -> Result<Vec<Record>> {
    let rows = match self {
      Self::Rows(rows) => rows,
      Self::Envelope(ApiEnvelope {
        success: true,
        data: Some(data),
        ..
      }) => data,
      Self::Envelope(envelope) => {
        return Err(eyre!(
          "Spreadsheet API reported an error: {}",
          envelope
            .error
            .or(envelope.message)
            .unwrap_or_else(|| "response carried no data".to_string())
        ));
      }
    };
    rows_to_records(rows)
  }
}

/// Normalize rows into objects.
///
/// A grid whose first row is all strings is treated as header + values; each
/// value row becomes an object carrying its 1-based sheet row number in
/// [`ROW_FIELD`]. Rows that are entirely blank are dropped.
fn rows_to_records(rows: Vec<Value>) -> Result<Vec<Record>> {
  let Some(first) = rows.first() else {
    return Ok(Vec::new());
  };

  match first {
    Value::Object(_) => rows
      .into_iter()
      .map(|row| match row {
        Value::Object(_) => Ok(row),
        other => Err(eyre!("Mixed row shapes in response: {}", other)),
      })
      .collect(),
    Value::Array(header) => {
      let header = header_names(header)?;
      let mut records = Vec::with_capacity(rows.len().saturating_sub(1));
      for (index, row) in rows.into_iter().enumerate().skip(1) {
        let Value::Array(cells) = row else {
          return Err(eyre!("Row {} is not an array", index + 1));
        };
        if cells.iter().all(is_blank) {
          continue;
        }
        let mut object = Map::new();
        for (i, cell) in cells.into_iter().enumerate() {
          // Cells past the header get the same generated name as blank headers
          let name = header
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("column_{}", i + 1));
          object.insert(name, cell);
        }
        object.insert(ROW_FIELD.to_string(), Value::from(index as u64 + 1));
        records.push(Value::Object(object));
      }
      Ok(records)
    }
    other => Err(eyre!("Unexpected row in response: {}", other)),
  }
}

fn header_names(header: &[Value]) -> Result<Vec<String>> {
  header
    .iter()
    .enumerate()
    .map(|(i, cell)| match cell {
      Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
      Value::String(_) => Ok(format!("column_{}", i + 1)),
      other => Err(eyre!("Header cell {} is not text: {}", i + 1, other)),
    })
    .collect()
}

fn is_blank(cell: &Value) -> bool {
  match cell {
    Value::Null => true,
    Value::String(s) => s.trim().is_empty(),
    _ => false,
  }
}
