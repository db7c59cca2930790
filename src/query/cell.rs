//! Typed cell values for ad-hoc query results.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{Column, Row, TypeInfo};

/// One result cell. Types without a dedicated variant come back as their
/// PostgreSQL text representation.
///
/// Cells serialize as plain JSON values, so deserializing picks the first
/// variant that fits: a `Text` cell holding an RFC 3339 string reads back
/// as `Timestamp`. Results are meant to be rendered, not round-tripped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

impl From<Option<String>> for CellValue {
    fn from(value: Option<String>) -> Self {
        value.map(CellValue::Text).unwrap_or(CellValue::Null)
    }
}

/// Decode every cell of a row.
pub fn decode_row(row: &PgRow) -> Vec<CellValue> {
    (0..row.columns().len()).map(|i| decode_cell(row, i)).collect()
}

/// Decode one cell by its reported type, falling back to text when the
/// type is unknown or its value does not decode.
pub fn decode_cell(row: &PgRow, index: usize) -> CellValue {
    let type_name = row.columns()[index].type_info().name().to_string();

    let typed = match type_name.as_str() {
        "BOOL" => row
            .try_get::<Option<bool>, _>(index)
            .map(|v| v.map(CellValue::Boolean)),
        "INT2" => row
            .try_get::<Option<i16>, _>(index)
            .map(|v| v.map(|n| CellValue::Integer(n.into()))),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)
            .map(|v| v.map(|n| CellValue::Integer(n.into()))),
        "INT8" => row
            .try_get::<Option<i64>, _>(index)
            .map(|v| v.map(CellValue::Integer)),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)
            .map(|v| v.map(|n| CellValue::Float(n.into()))),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(index)
            .map(|v| v.map(CellValue::Float)),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)
            .map(|v| v.map(CellValue::Timestamp)),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)
            .map(|v| v.map(|t| CellValue::Timestamp(t.and_utc()))),
        _ => return text_cell(row, index),
    };

    match typed {
        Ok(Some(cell)) => cell,
        Ok(None) => CellValue::Null,
        Err(e) => {
            tracing::debug!("Query: column {} ({}) decoded as text: {}", index, type_name, e);
            text_cell(row, index)
        }
    }
}

fn text_cell(row: &PgRow, index: usize) -> CellValue {
    match row.try_get_unchecked::<Option<String>, _>(index) {
        Ok(value) => value.into(),
        Err(e) => {
            tracing::warn!("Query: could not decode column {}: {}", index, e);
            CellValue::Null
        }
    }
}
