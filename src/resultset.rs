//! Query results and result set assembly.

use bytes::{Buf, Bytes};

use crate::error::{Error, Result};
use crate::messages::backend::{EofPacket, OkPacket};
use crate::types::{self, ColumnDefinition, Value};
use crate::wire;

/// One row of a result set, indexed by column position.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }
}

impl std::ops::Index<usize> for Row {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.values[index]
    }
}

/// An ordered collection of rows plus their column metadata.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    columns: Vec<ColumnDefinition>,
    rows: Vec<Row>,
}

impl ResultSet {
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Row> {
        self.rows.get(index)
    }

    /// Position of the named column, if present.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// Outcome of a completed query.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Rows changed by a mutation, or rows returned by a select.
    pub affected_rows: i64,
    /// Human-readable status info from the server, when present.
    pub status_message: Option<String>,
    /// Auto-increment id of the last inserted row; `-1` when the query
    /// produced a result set instead.
    pub last_insert_id: i64,
    /// Server status flags after the query.
    pub status_flags: u16,
    /// Warning count after the query.
    pub warnings: u16,
    /// Rows and metadata, for queries that return them.
    pub result_set: Option<ResultSet>,
}

impl QueryResult {
    pub(crate) fn from_ok(ok: OkPacket) -> Self {
        Self {
            affected_rows: ok.affected_rows as i64,
            status_message: (!ok.info.is_empty()).then_some(ok.info),
            last_insert_id: ok.last_insert_id as i64,
            status_flags: ok.status_flags,
            warnings: ok.warnings,
            result_set: None,
        }
    }

    pub(crate) fn from_result_set(result_set: ResultSet, eof: EofPacket) -> Self {
        Self {
            affected_rows: result_set.len() as i64,
            status_message: None,
            last_insert_id: -1,
            status_flags: eof.status_flags,
            warnings: eof.warnings,
            result_set: Some(result_set),
        }
    }

    /// The result set, for queries that returned one.
    pub fn result_set(&self) -> Option<&ResultSet> {
        self.result_set.as_ref()
    }
}

/// Assembles column definitions and row frames into a [`ResultSet`].
///
/// Text rows arrive as raw byte strings and are decoded against each
/// column's declared type; binary rows arrive as one opaque payload and
/// are decoded against the column types cached here.
#[derive(Debug, Default)]
pub struct ResultSetAccumulator {
    columns: Vec<ColumnDefinition>,
    rows: Vec<Row>,
}

impl ResultSetAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_column_definition(&mut self, column: ColumnDefinition) {
        self.columns.push(column);
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn on_text_row(&mut self, values: Vec<Option<Bytes>>) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(Error::Unexpected(format!(
                "row has {} values for {} columns",
                values.len(),
                self.columns.len()
            )));
        }
        let row = values
            .into_iter()
            .zip(self.columns.iter())
            .map(|(value, column)| match value {
                None => Value::Null,
                Some(data) => {
                    types::decode_text_value(column.column_type, &data, column.is_unsigned())
                }
            })
            .collect();
        self.rows.push(Row::new(row));
        Ok(())
    }

    pub fn on_binary_row(&mut self, mut payload: Bytes) -> Result<()> {
        wire::need(&payload, 1)?;
        payload.advance(1); // 0x00 row header

        // NULL bitmap with a 2-bit offset, per the binary row format.
        let bitmap_len = (self.columns.len() + 7 + 2) / 8;
        wire::need(&payload, bitmap_len)?;
        let bitmap = payload.split_to(bitmap_len);

        let mut values = Vec::with_capacity(self.columns.len());
        for (i, column) in self.columns.iter().enumerate() {
            let bit = i + 2;
            if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
                values.push(Value::Null);
            } else {
                values.push(types::read_binary_value(&mut payload, column)?);
            }
        }
        if payload.has_remaining() {
            return Err(Error::BufferNotFullyConsumed {
                remaining: payload.remaining(),
            });
        }
        self.rows.push(Row::new(values));
        Ok(())
    }

    /// Consumes the accumulated state into a complete result set.
    pub fn finish(&mut self) -> ResultSet {
        ResultSet {
            columns: std::mem::take(&mut self.columns),
            rows: std::mem::take(&mut self.rows),
        }
    }

    /// Discards everything collected so far.
    pub fn reset(&mut self) {
        self.columns.clear();
        self.rows.clear();
    }
}
