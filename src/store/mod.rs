// src/store/mod.rs

//! The relational store the pipeline talks to.
//!
//! The core only ever issues relation DDL (CREATE / DROP), set-based
//! `INSERT ... SELECT` statements, bulk appends of in-memory rows and a few
//! catalog lookups, so that is all this trait exposes.

use crate::error::Result;
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;

/// A schema-qualified relation name such as `stage.listing_stage`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationName {
    pub schema: Option<String>,
    pub name: String,
}

impl RelationName {
    pub fn new(schema: Option<&str>, name: &str) -> Self {
        Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Quoted form usable inside SQL text.
    pub fn qualified(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }

    /// Same relation in the same schema under another name.
    pub fn sibling(&self, name: &str) -> Self {
        Self {
            schema: self.schema.clone(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for RelationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Double-quote an identifier, doubling any embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Column types the pipeline creates. Anything else found in the store is
/// mapped onto the closest family when comparing definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SqlType {
    Text,
    Double,
    BigInt,
    Date,
}

impl SqlType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Text => "VARCHAR",
            SqlType::Double => "DOUBLE",
            SqlType::BigInt => "BIGINT",
            SqlType::Date => "DATE",
        }
    }

    /// Map a catalog type name (`information_schema.columns.data_type`).
    pub fn from_catalog(data_type: &str) -> Option<Self> {
        let upper = data_type.trim().to_ascii_uppercase();
        let base = upper.split('(').next().unwrap_or_default().trim();
        match base {
            "VARCHAR" | "TEXT" | "STRING" | "CHAR" | "BPCHAR" | "NVARCHAR" => Some(SqlType::Text),
            "DOUBLE" | "FLOAT" | "REAL" | "FLOAT4" | "FLOAT8" | "DECIMAL" | "NUMERIC" => {
                Some(SqlType::Double)
            }
            "BIGINT" | "INTEGER" | "INT" | "INT4" | "INT8" | "SMALLINT" | "TINYINT" | "HUGEINT"
            | "UBIGINT" | "UINTEGER" | "USMALLINT" | "UTINYINT" => Some(SqlType::BigInt),
            "DATE" => Some(SqlType::Date),
            _ => None,
        }
    }
}

/// One column of a relation definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: SqlType,
    /// Carries the primary-key constraint (surrogate keys only).
    pub primary_key: bool,
}

impl ColumnDef {
    pub fn new(name: &str, ty: SqlType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            primary_key: false,
        }
    }

    pub fn primary_key(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ty: SqlType::BigInt,
            primary_key: true,
        }
    }
}

/// Render `CREATE TABLE` for `columns`.
pub fn create_table_sql(relation: &RelationName, columns: &[ColumnDef]) -> String {
    let cols = columns
        .iter()
        .map(|c| {
            let mut def = format!("{} {}", quote_ident(&c.name), c.ty.as_sql());
            if c.primary_key {
                def.push_str(" PRIMARY KEY");
            }
            def
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {} ({})", relation.qualified(), cols)
}

/// A scalar cell, either normalized for staging or read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

/// The store collaborator.
///
/// Implementations execute one relation-mutating statement at a time;
/// callers hand a `&S` to every builder instead of sharing a global
/// connection.
pub trait RelationalStore {
    /// Cheap round trip used to validate the connection before a run.
    fn ping(&self) -> Result<()>;

    /// Execute one statement, returning the affected row count.
    fn execute(&self, statement: &str) -> Result<usize>;

    /// Execute several `;`-separated statements.
    fn execute_batch(&self, statements: &str) -> Result<()>;

    /// Append `rows` to `relation`, flushing every `chunk_size` rows.
    fn bulk_insert(
        &self,
        relation: &RelationName,
        rows: &[Vec<Value>],
        chunk_size: usize,
    ) -> Result<usize>;

    fn relation_exists(&self, relation: &RelationName) -> Result<bool>;

    /// Column definitions of `relation`, `None` when it does not exist.
    fn describe(&self, relation: &RelationName) -> Result<Option<Vec<ColumnDef>>>;

    /// Run a query and materialize every row.
    fn query(&self, sql: &str) -> Result<Vec<Vec<Value>>>;

    fn ensure_schema(&self, schema: &str) -> Result<()> {
        self.execute_batch(&format!("CREATE SCHEMA IF NOT EXISTS {};", quote_ident(schema)))
    }

    fn drop_relation(&self, relation: &RelationName) -> Result<()> {
        self.execute_batch(&format!("DROP TABLE IF EXISTS {};", relation.qualified()))
    }

    fn count(&self, relation: &RelationName) -> Result<u64> {
        let rows = self.query(&format!("SELECT count(*) FROM {}", relation.qualified()))?;
        Ok(rows
            .first()
            .and_then(|r| r.first())
            .and_then(Value::as_i64)
            .unwrap_or(0) as u64)
    }

    fn begin(&self) -> Result<()> {
        self.execute_batch("BEGIN TRANSACTION;")
    }

    fn commit(&self) -> Result<()> {
        self.execute_batch("COMMIT;")
    }

    fn rollback(&self) -> Result<()> {
        self.execute_batch("ROLLBACK;")
    }
}
