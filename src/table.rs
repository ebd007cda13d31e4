//! Materialised rows and the cell values they hold.

use crate::error::{PipelineError, Result, ResultExt as _};
use crate::schema::{ColumnType, Schema};
use chrono::{NaiveDate, NaiveDateTime};
use csv::StringRecord;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::path::Path;

/// A single cell.
///
/// Numbers are always doubles so that both backends agree on arithmetic and
/// aggregation results. Equality and hashing treat `-0.0 == 0.0` and all NaNs
/// as one value, which is what grouping and joining need.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

pub type Row = Vec<Value>;

impl Value {
    /// Parse a CSV field according to the column type. Empty fields and
    /// unparseable numbers or booleans become null.
    pub fn parse(field: &str, kind: ColumnType) -> Self {
        if field.is_empty() {
            return Self::Null;
        }
        match kind {
            ColumnType::Number => field.parse::<f64>().map_or(Self::Null, Self::Number),
            ColumnType::Boolean => match field {
                "true" => Self::Bool(true),
                "false" => Self::Bool(false),
                _ => Self::Null,
            },
            ColumnType::String | ColumnType::Temporal | ColumnType::Unknown => {
                Self::Text(field.to_owned())
            }
        }
    }

    /// CSV rendering of the value.
    pub fn render(&self) -> Cow<'_, str> {
        match self {
            Self::Null => Cow::Borrowed(""),
            Self::Bool(true) => Cow::Borrowed("true"),
            Self::Bool(false) => Cow::Borrowed("false"),
            Self::Number(n) => Cow::Owned(format_number(*n)),
            Self::Text(s) => Cow::Borrowed(s),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// SQL-style comparison: `None` when either side is null or the two
    /// values are of different kinds.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.partial_cmp(b),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Total order used for sorting: nulls after every other value.
    pub fn sort_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Null, _) => Ordering::Greater,
            (_, Self::Null) => Ordering::Less,
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            _ => self.compare(other).unwrap_or(Ordering::Equal),
        }
    }

    fn canonical_bits(n: f64) -> u64 {
        if n.is_nan() {
            f64::NAN.to_bits()
        } else if n == 0.0 {
            0.0_f64.to_bits()
        } else {
            n.to_bits()
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => {
                Self::canonical_bits(*a) == Self::canonical_bits(*b)
            }
            (Self::Text(a), Self::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Bool(b) => b.hash(state),
            Self::Number(n) => Self::canonical_bits(*n).hash(state),
            Self::Text(s) => s.hash(state),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Shortest round-trip decimal, without a trailing `.0` for whole numbers.
pub fn format_number(n: f64) -> String {
    format!("{n}")
}

/// Whether a non-empty field looks like an ISO date or datetime.
pub fn looks_temporal(field: &str) -> bool {
    NaiveDate::parse_from_str(field, "%Y-%m-%d").is_ok()
        || NaiveDateTime::parse_from_str(field, "%Y-%m-%d %H:%M:%S").is_ok()
        || NaiveDateTime::parse_from_str(field, "%Y-%m-%dT%H:%M:%S").is_ok()
}

/// Schema plus row-major values.
/// Rows plus their schema.
///
/// Rows read from a file can carry their source text alongside the parsed
/// values. Steps that keep rows intact pass it on; anything that derives new
/// rows drops it. Equality ignores the text.
#[derive(Debug, Clone)]
pub struct Table {
    schema: Schema,
    rows: Vec<Row>,
    text: Option<Vec<StringRecord>>,
}

impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        self.schema == other.schema && self.rows == other.rows
    }
}

impl Table {
    /// Build a table, checking every row has one value per column.
    pub fn new(schema: Schema, rows: Vec<Row>) -> Result<Self> {
        if let Some((idx, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != schema.len())
        {
            return Err(PipelineError::Other(format!(
                "row {idx} has {} values but the schema has {} columns",
                row.len(),
                schema.len()
            )));
        }
        Ok(Self {
            schema,
            rows,
            text: None,
        })
    }

    pub fn empty(schema: Schema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
            text: None,
        }
    }

    /// Attach the source text of every row, one record per row.
    pub fn with_text(mut self, text: Vec<StringRecord>) -> Result<Self> {
        if text.len() != self.rows.len() {
            return Err(PipelineError::Other(format!(
                "{} text records for {} rows",
                text.len(),
                self.rows.len()
            )));
        }
        self.text = Some(text);
        Ok(self)
    }

    /// Source text of the rows, when still known.
    pub fn text(&self) -> Option<&[StringRecord]> {
        self.text.as_deref()
    }

    /// Like [`Table::into_parts`], keeping the source text.
    pub fn into_parts_with_text(self) -> (Schema, Vec<Row>, Option<Vec<StringRecord>>) {
        (self.schema, self.rows, self.text)
    }

    /// Fields of row `idx`: the source text when known, the rendered values
    /// otherwise.
    pub fn fields(&self, idx: usize) -> Vec<Cow<'_, str>> {
        match &self.text {
            Some(text) => (0..self.schema.len())
                .map(|col| Cow::Borrowed(text[idx].get(col).unwrap_or("")))
                .collect(),
            None => self.rows[idx].iter().map(Value::render).collect(),
        }
    }

    /// Parse text records according to `schema`.
    pub fn from_text<S: AsRef<str>>(schema: Schema, records: &[Vec<S>]) -> Result<Self> {
        let rows = records
            .iter()
            .map(|record| {
                schema
                    .iter()
                    .zip(record.iter())
                    .map(|(column, field)| Value::parse(field.as_ref(), column.kind))
                    .collect()
            })
            .collect();
        Self::new(schema, rows)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_parts(self) -> (Schema, Vec<Row>) {
        (self.schema, self.rows)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of one column, top to bottom.
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.schema.index_of(name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }

    /// Append the rows of `other`, which must have the same schema.
    pub fn append(&mut self, other: Self) -> Result<()> {
        if other.schema != self.schema {
            return Err(PipelineError::Other(format!(
                "cannot append rows with schema {} to {}",
                other.schema, self.schema
            )));
        }
        self.text = match (self.text.take(), other.text) {
            (Some(mut text), Some(more)) => {
                text.extend(more);
                Some(text)
            }
            (None, more) if self.rows.is_empty() => more,
            (text, None) if other.rows.is_empty() => text,
            _ => None,
        };
        self.rows.extend(other.rows);
        Ok(())
    }

    /// Concatenate chunks that share `schema`.
    pub fn concat(schema: Schema, tables: impl IntoIterator<Item = Result<Self>>) -> Result<Self> {
        let mut out = Self::empty(schema);
        for table in tables {
            out.append(table?)?;
        }
        Ok(out)
    }

    /// Rows rendered back to CSV fields.
    pub fn to_text(&self) -> Vec<Vec<String>> {
        self.rows
            .iter()
            .map(|row| row.iter().map(|v| v.render().into_owned()).collect())
            .collect()
    }

    /// Write the table as a UTF-8 CSV file with a header row.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path).for_destination(path)?;
        writer
            .write_record(self.schema.iter().map(|c| c.name.as_str()))
            .for_destination(path)?;
        for row in &self.rows {
            writer
                .write_record(row.iter().map(|v| v.render().into_owned()))
                .for_destination(path)?;
        }
        writer.flush().for_destination(path)?;
        Ok(())
    }
}
