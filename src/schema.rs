//! Column structure shared by every component.
//!
//! A [`Schema`] is an ordered list of uniquely named, typed columns. Order is
//! significant: it is the output column order. Schemas are values; pipeline
//! steps produce new ones instead of mutating their input.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Number,
    Boolean,
    Temporal,
    Unknown,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Temporal => "temporal",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a type name as used in operation parameters.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "string" | "text" | "str" => Some(Self::String),
            "number" | "numeric" | "f64" | "float" => Some(Self::Number),
            "boolean" | "bool" => Some(Self::Boolean),
            "temporal" | "date" | "datetime" => Some(Self::Temporal),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Text-like columns are stored as strings by both backends.
    pub fn is_text_like(self) -> bool {
        matches!(self, Self::String | Self::Temporal | Self::Unknown)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Ordered, uniquely named columns.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Column>", into = "Vec<Column>")]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    /// Build a schema, rejecting duplicate column names.
    pub fn new(columns: Vec<Column>) -> Result<Self, String> {
        for (idx, column) in columns.iter().enumerate() {
            if columns[..idx].iter().any(|c| c.name == column.name) {
                return Err(format!("duplicate column name '{}'", column.name));
            }
        }
        Ok(Self { columns })
    }

    /// Convenience constructor for literal schemas.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, ColumnType)>) -> Result<Self, String> {
        Self::new(pairs.into_iter().map(|(n, t)| Column::new(n, t)).collect())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn iter(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn type_of(&self, name: &str) -> Option<ColumnType> {
        self.get(name).map(|c| c.kind)
    }

    /// Names from `wanted` that are not columns of this schema.
    pub fn missing<'a>(&self, wanted: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        wanted
            .into_iter()
            .filter(|name| !self.contains(name))
            .cloned()
            .collect()
    }

    /// New schema with `column` replacing the column of the same name in place,
    /// or appended at the end.
    pub fn with_column(&self, column: Column) -> Self {
        let mut columns = self.columns.clone();
        match columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => columns.push(column),
        }
        Self { columns }
    }
}

impl TryFrom<Vec<Column>> for Schema {
    type Error = String;

    fn try_from(columns: Vec<Column>) -> Result<Self, Self::Error> {
        Self::new(columns)
    }
}

impl From<Schema> for Vec<Column> {
    fn from(schema: Schema) -> Self {
        schema.columns
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{}: {}", c.name, c.kind))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}
