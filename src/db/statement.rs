//! Store-agnostic statements, values and rows.
//!
//! Statements are built structurally so that both the PostgreSQL provider
//! (which renders them to SQL with `$n` placeholders) and the in-memory store
//! (which interprets them directly) can execute the same repository code.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::StoreError;

// ============================================================================
// Values
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Uuid(Uuid),
    Json(serde_json::Value),
    Timestamp(DateTime<Utc>),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

/// Typed extraction of a column value.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Text(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromValue for Uuid {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Uuid(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Json(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(None),
            other => T::from_value(other).map(Some),
        }
    }
}

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, column: impl Into<String>, value: Value) {
        self.columns.push((column.into(), value));
    }

    pub fn value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn get<T: FromValue>(&self, column: &str) -> Result<T, StoreError> {
        let value = self.value(column).ok_or_else(|| StoreError::Decode {
            column: column.to_string(),
            reason: "no such column".to_string(),
        })?;
        T::from_value(value).ok_or_else(|| StoreError::Decode {
            column: column.to_string(),
            reason: format!("unexpected value {value:?}"),
        })
    }
}

/// Outcome of a statement that does not return rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecSummary {
    pub rows_affected: u64,
}

// ============================================================================
// Statements
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

impl Insert {
    pub fn into_table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            columns: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn value(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.columns.push(column.to_string());
        self.values.push(value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: String,
    /// Empty means every column.
    pub columns: Vec<String>,
    pub filters: Vec<(String, Value)>,
    pub order_by: Option<String>,
}

impl Select {
    pub fn from_table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            columns: Vec::new(),
            filters: Vec::new(),
            order_by: None,
        }
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn filter_eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push((column.to_string(), value.into()));
        self
    }

    pub fn order_by(mut self, column: &str) -> Self {
        self.order_by = Some(column.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Insert(Insert),
    Select(Select),
    /// Hand-written SQL; only the PostgreSQL provider accepts it.
    Raw { sql: String, args: Vec<Value> },
}

impl Statement {
    pub fn raw(sql: &str) -> Self {
        Statement::Raw {
            sql: sql.to_string(),
            args: Vec::new(),
        }
    }

    /// Render as PostgreSQL text with positional placeholders.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        match self {
            Statement::Insert(insert) => {
                let placeholders = (1..=insert.values.len())
                    .map(|n| format!("${n}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    insert.table,
                    insert.columns.join(", "),
                    placeholders
                );
                (sql, insert.values.clone())
            }
            Statement::Select(select) => {
                let columns = if select.columns.is_empty() {
                    "*".to_string()
                } else {
                    select.columns.join(", ")
                };
                let mut sql = format!("SELECT {} FROM {}", columns, select.table);
                let mut args = Vec::with_capacity(select.filters.len());
                for (n, (column, value)) in select.filters.iter().enumerate() {
                    let keyword = if n == 0 { "WHERE" } else { "AND" };
                    sql.push_str(&format!(" {} {} = ${}", keyword, column, n + 1));
                    args.push(value.clone());
                }
                if let Some(order_by) = &select.order_by {
                    sql.push_str(&format!(" ORDER BY {order_by}"));
                }
                (sql, args)
            }
            Statement::Raw { sql, args } => (sql.clone(), args.clone()),
        }
    }
}

impl From<Insert> for Statement {
    fn from(insert: Insert) -> Self {
        Statement::Insert(insert)
    }
}

impl From<Select> for Statement {
    fn from(select: Select) -> Self {
        Statement::Select(select)
    }
}
